//! IP endpoint value type.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::NetError;

/// An immutable (IP address, port) pair identifying one side of a transport
/// connection.
///
/// The address variant always matches the contents; configuration paths that
/// carry an unspecified port use `Option<u16>` instead of a sentinel, so a
/// missing port can never reach the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IpEndpoint {
    /// The IP address, v4 or v6.
    pub addr: IpAddr,
    /// The port, 0 when not yet assigned (e.g. fresh DNS results).
    pub port: u16,
}

impl IpEndpoint {
    /// Create an endpoint from an address and port.
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Whether the address is IPv6.
    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// The OS-level socket address for this endpoint.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl From<SocketAddr> for IpEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<IpEndpoint> for SocketAddr {
    fn from(endpoint: IpEndpoint) -> Self {
        endpoint.socket_addr()
    }
}

impl fmt::Display for IpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(addr) => write!(f, "{}:{}", addr, self.port),
            IpAddr::V6(addr) => write!(f, "[{}]:{}", addr, self.port),
        }
    }
}

impl FromStr for IpEndpoint {
    type Err = NetError;

    /// Parse `"1.2.3.4:80"`, `"[::1]:80"` or a bare address (port 0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = SocketAddr::from_str(s) {
            return Ok(addr.into());
        }
        if let Ok(addr) = IpAddr::from_str(s) {
            return Ok(Self::new(addr, 0));
        }
        Err(NetError::Protocol(format!("invalid endpoint '{}'", s)))
    }
}
