//! Datagram endpoint for sending and receiving bounded packets.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::debug;

use crate::endpoint::IpEndpoint;
use crate::error::{NetError, Result};
use crate::subsystem::Networking;

/// A stateless UDP socket.
///
/// Creation mirrors the TCP socket's dual-stack policy: IPv6 with
/// `IPV6_V6ONLY` off where available, IPv4 fallback otherwise.
pub struct UdpSocket {
    sock: std::net::UdpSocket,
    use_ipv4_only: bool,
}

fn create_datagram_socket() -> Result<(Socket, bool)> {
    match Socket::new(Domain::IPV6, Type::DGRAM, None) {
        Ok(sock) => {
            if let Err(e) = sock.set_only_v6(false) {
                debug!(error = %e, "clearing IPV6_V6ONLY failed");
            }
            Ok((sock, false))
        }
        Err(_) => {
            let sock =
                Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(NetError::from_io)?;
            Ok((sock, true))
        }
    }
}

impl UdpSocket {
    /// Create an unbound socket for outgoing datagrams.
    pub fn new() -> Result<Self> {
        Networking::ensure_initialised()?;
        let (sock, use_ipv4_only) = create_datagram_socket()?;
        Ok(Self {
            sock: sock.into(),
            use_ipv4_only,
        })
    }

    /// Bind to `port` for receiving, preferring the IPv6 any-address.
    pub fn bind_to_port(port: u16, reuse_address: bool) -> Result<Self> {
        Networking::ensure_initialised()?;
        let (sock, use_ipv4_only) = create_datagram_socket()?;
        let bind_addr = if use_ipv4_only {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
        };
        if reuse_address {
            sock.set_reuse_address(true).map_err(NetError::from_io)?;
        }
        sock.bind(&SockAddr::from(bind_addr)).map_err(|e| {
            NetError::ConnectionFailed {
                detail: format!("failed to bind UDP port {}: {}", port, e),
            }
        })?;
        Ok(Self {
            sock: sock.into(),
            use_ipv4_only,
        })
    }

    /// Send one datagram to `dest`. A short send is an error.
    pub fn send_packet(&self, data: &[u8], dest: IpEndpoint) -> Result<()> {
        let addr = match dest.addr {
            IpAddr::V4(v4) if !self.use_ipv4_only => {
                SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), dest.port)
            }
            IpAddr::V6(_) if self.use_ipv4_only => {
                return Err(NetError::ConnectionFailed {
                    detail: format!(
                        "cannot reach IPv6 endpoint {} with an IPv4-only socket",
                        dest
                    ),
                })
            }
            addr => SocketAddr::new(addr, dest.port),
        };
        let sent = self.sock.send_to(data, addr).map_err(NetError::from_io)?;
        if sent < data.len() {
            return Err(NetError::Protocol(format!(
                "short datagram send: {} of {} bytes",
                sent,
                data.len()
            )));
        }
        Ok(())
    }

    /// Receive one datagram into `buf`, returning the byte count and the
    /// sender. Returns `None` when the socket is non-blocking and no
    /// datagram is queued.
    pub fn read_packet(&self, buf: &mut [u8]) -> Result<Option<(usize, IpEndpoint)>> {
        match self.sock.recv_from(buf) {
            Ok((n, from)) => Ok(Some((
                n,
                IpEndpoint::new(from.ip().to_canonical(), from.port()),
            ))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(NetError::from_io(e)),
        }
    }

    /// Toggle blocking mode.
    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        self.sock
            .set_nonblocking(!blocking)
            .map_err(NetError::from_io)
    }

    /// Allow sending to broadcast addresses.
    pub fn enable_broadcast(&self) -> Result<()> {
        self.sock.set_broadcast(true).map_err(NetError::from_io)
    }

    /// The locally bound port.
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.sock.local_addr().map_err(NetError::from_io)?.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        let _ = Networking::init();
    }

    #[test]
    fn test_loopback_round_trip() {
        init();
        let receiver = UdpSocket::bind_to_port(0, true).unwrap();
        let port = receiver.local_port().unwrap();
        let sender = UdpSocket::new().unwrap();

        sender
            .send_packet(b"datagram", IpEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = receiver.read_packet(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"datagram");
        assert_ne!(from.port, 0);
    }

    #[test]
    fn test_nonblocking_read_returns_none() {
        init();
        let socket = UdpSocket::bind_to_port(0, true).unwrap();
        socket.set_blocking(false).unwrap();
        let mut buf = [0u8; 16];
        assert!(socket.read_packet(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_broadcast_flag() {
        init();
        let socket = UdpSocket::new().unwrap();
        socket.enable_broadcast().unwrap();
    }
}
