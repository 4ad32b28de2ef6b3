//! Process-wide networking state: init/shutdown bracket, DNS resolution and
//! last-error reporting.

use std::io;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::endpoint::IpEndpoint;
use crate::error::{NetError, Result};

// Read without locking; callers synchronize init/shutdown externally.
static INITIALISED: AtomicBool = AtomicBool::new(false);

/// Process-wide networking subsystem.
///
/// [`Networking::init`] must bracket all socket use. On Windows the standard
/// library performs the WinSock 2.2 startup lazily on first socket use; the
/// bracket tracks the process-wide flag and keeps double-init a contract
/// violation either way.
pub struct Networking;

impl Networking {
    /// Initialise the networking subsystem.
    ///
    /// Fails with [`NetError::AlreadyInitialised`] when called twice without
    /// an intervening [`Networking::shutdown`].
    pub fn init() -> Result<()> {
        if INITIALISED.swap(true, Ordering::SeqCst) {
            return Err(NetError::AlreadyInitialised);
        }
        debug!("networking subsystem initialised");
        Ok(())
    }

    /// Tear down the networking subsystem.
    pub fn shutdown() {
        INITIALISED.store(false, Ordering::SeqCst);
        debug!("networking subsystem shut down");
    }

    /// Whether [`Networking::init`] has been called.
    pub fn is_initialised() -> bool {
        INITIALISED.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_initialised() -> Result<()> {
        if !Self::is_initialised() {
            return Err(NetError::NotInitialised);
        }
        Ok(())
    }

    /// Resolve a hostname to an ordered, non-empty sequence of endpoints.
    ///
    /// Ports of the returned endpoints are not initialised (zero). The
    /// platform resolver restricts results to address families configured on
    /// the host, so the first entry is the preferred connect target.
    pub fn resolve(hostname: &str) -> Result<Vec<IpEndpoint>> {
        let addrs = (hostname, 0u16).to_socket_addrs().map_err(|e| NetError::Dns {
            hostname: hostname.to_string(),
            source: e,
        })?;
        let endpoints: Vec<IpEndpoint> =
            addrs.map(|addr| IpEndpoint::new(addr.ip(), 0)).collect();
        if endpoints.is_empty() {
            return Err(NetError::Dns {
                hostname: hostname.to_string(),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    "resolver returned no addresses",
                ),
            });
        }
        Ok(endpoints)
    }

    /// Human-readable description of the calling thread's most recent OS
    /// networking error. Read it immediately after the failing operation.
    pub fn last_error_text() -> String {
        io::Error::last_os_error().to_string()
    }

    /// The local host name.
    #[cfg(unix)]
    pub fn hostname() -> Result<String> {
        let mut buf = [0u8; 256];
        // SAFETY: buf outlives the call and its length is passed alongside.
        let rc = unsafe {
            libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        };
        if rc != 0 {
            return Err(NetError::last_os_error());
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The init/shutdown cycle itself is exercised in a dedicated integration
    // test binary; flipping the process-wide flag here would race the socket
    // tests running in this binary.

    #[test]
    fn test_resolve_v4_literal() {
        let endpoints = Networking::resolve("127.0.0.1").unwrap();
        assert!(!endpoints.is_empty());
        assert_eq!(endpoints[0].addr.to_string(), "127.0.0.1");
        assert_eq!(endpoints[0].port, 0);
    }

    #[test]
    fn test_resolve_v6_literal() {
        let endpoints = Networking::resolve("::1").unwrap();
        assert!(!endpoints.is_empty());
        assert!(endpoints[0].is_ipv6());
    }

    #[test]
    fn test_resolve_failure_names_host() {
        let err = Networking::resolve("").unwrap_err();
        match err {
            NetError::Dns { hostname, .. } => assert_eq!(hostname, ""),
            other => panic!("Expected Dns error, got {:?}", other),
        }
    }

    #[test]
    fn test_last_error_text_is_nonempty() {
        assert!(!Networking::last_error_text().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_hostname() {
        let name = Networking::hostname().unwrap();
        assert!(!name.is_empty());
    }
}
