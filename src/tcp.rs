//! Blocking TCP socket with dual-stack connect/listen and cross-thread
//! cancellation.

use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::fd::AsRawFd;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, SockAddr, Socket, TcpKeepalive, Type};
use tracing::debug;

use crate::endpoint::IpEndpoint;
use crate::error::{NetError, Result};
#[cfg(target_os = "linux")]
use crate::event_fd::EventFd;
use crate::subsystem::Networking;
use crate::transport::{Transport, MAX_RW_CHUNK};

const LISTEN_BACKLOG: i32 = 10;

#[cfg(target_os = "linux")]
const POLL_READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLRDHUP;
#[cfg(all(unix, not(target_os = "linux")))]
const POLL_READ_EVENTS: libc::c_short = libc::POLLIN;

/// A blocking TCP socket.
///
/// Fresh client sockets are IPv6 with `IPV6_V6ONLY` off so both address
/// families are reachable; on hosts without IPv6 support, creation falls
/// back to IPv4 once and the socket performs no IPv6 operations thereafter.
#[derive(Debug)]
pub struct TcpSocket {
    sock: Socket,
    use_ipv4_only: bool,
    killed: AtomicBool,
    network_byte_order: AtomicBool,
    split_u64: AtomicBool,
    peer: Mutex<Option<IpEndpoint>>,
}

fn create_stream_socket() -> Result<(Socket, bool)> {
    match Socket::new(Domain::IPV6, Type::STREAM, None) {
        Ok(sock) => {
            // Dual-stack: accept and originate IPv4 connections as well.
            if let Err(e) = sock.set_only_v6(false) {
                debug!(error = %e, "clearing IPV6_V6ONLY failed");
            }
            Ok((sock, false))
        }
        #[cfg(not(windows))]
        Err(_) => {
            // No IPv6 support on this host: fall back to IPv4 and remember
            // that state.
            let sock =
                Socket::new(Domain::IPV4, Type::STREAM, None).map_err(NetError::from_io)?;
            Ok((sock, true))
        }
        #[cfg(windows)]
        Err(e) => Err(NetError::from_io(e)),
    }
}

impl TcpSocket {
    /// Create an unconnected client-side socket.
    pub fn new() -> Result<Self> {
        Networking::ensure_initialised()?;
        let (sock, use_ipv4_only) = create_stream_socket()?;
        Ok(Self::from_parts(sock, use_ipv4_only, None))
    }

    fn from_parts(sock: Socket, use_ipv4_only: bool, peer: Option<IpEndpoint>) -> Self {
        Self {
            sock,
            use_ipv4_only,
            killed: AtomicBool::new(false),
            network_byte_order: AtomicBool::new(true),
            split_u64: AtomicBool::new(true),
            peer: Mutex::new(peer),
        }
    }

    /// Resolve `hostname` and connect to the first resolved address.
    pub fn connect(hostname: &str, port: u16) -> Result<Self> {
        let socket = Self::new()?;
        socket.connect_to_host(hostname, port)?;
        Ok(socket)
    }

    /// Resolve `hostname` and connect this socket to the first resolved
    /// address.
    pub fn connect_to_host(&self, hostname: &str, port: u16) -> Result<()> {
        let endpoints = Networking::resolve(hostname)?;
        let target = IpEndpoint::new(endpoints[0].addr, port);
        self.connect_endpoint_inner(target, Some(hostname))
    }

    /// Connect this socket to a known endpoint, skipping DNS.
    pub fn connect_to_endpoint(&self, endpoint: IpEndpoint) -> Result<()> {
        self.connect_endpoint_inner(endpoint, None)
    }

    fn connect_endpoint_inner(
        &self,
        endpoint: IpEndpoint,
        hostname: Option<&str>,
    ) -> Result<()> {
        let addr = self.routable_addr(endpoint)?;
        if let Err(e) = self.sock.connect(&SockAddr::from(addr)) {
            let detail = match hostname {
                Some(host) => {
                    format!("could not connect to '{}' ({}): {}", host, endpoint, e)
                }
                None => format!("could not connect to {}: {}", endpoint, e),
            };
            return Err(NetError::ConnectionFailed { detail });
        }
        *self.peer.lock() = Some(endpoint);
        Ok(())
    }

    // An IPv4 target on a dual-stack IPv6 socket must go through the
    // v4-mapped form.
    fn routable_addr(&self, endpoint: IpEndpoint) -> Result<SocketAddr> {
        match endpoint.addr {
            IpAddr::V4(v4) if !self.use_ipv4_only => {
                Ok(SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), endpoint.port))
            }
            IpAddr::V6(_) if self.use_ipv4_only => Err(NetError::ConnectionFailed {
                detail: format!(
                    "cannot reach IPv6 endpoint {} with an IPv4-only socket",
                    endpoint
                ),
            }),
            addr => Ok(SocketAddr::new(addr, endpoint.port)),
        }
    }

    /// Bind a listening socket on `port`.
    ///
    /// Prefers a dual-stack IPv6 any-address listener; the socket is created
    /// only once the address family is known. Backlog is fixed at 10.
    pub fn bind_and_listen(port: u16, reuse_address: bool) -> Result<Self> {
        Networking::ensure_initialised()?;
        let (sock, use_ipv4_only, bind_addr) =
            match Socket::new(Domain::IPV6, Type::STREAM, None) {
                Ok(sock) => {
                    if let Err(e) = sock.set_only_v6(false) {
                        debug!(error = %e, "clearing IPV6_V6ONLY failed");
                    }
                    let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
                    (sock, false, addr)
                }
                Err(_) => {
                    let sock = Socket::new(Domain::IPV4, Type::STREAM, None)
                        .map_err(NetError::from_io)?;
                    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
                    (sock, true, addr)
                }
            };
        if reuse_address {
            sock.set_reuse_address(true).map_err(NetError::from_io)?;
        }
        sock.bind(&SockAddr::from(bind_addr)).map_err(|e| {
            NetError::ConnectionFailed {
                detail: format!("failed to bind to port {}: {}", port, e),
            }
        })?;
        sock.listen(LISTEN_BACKLOG)
            .map_err(|e| NetError::ConnectionFailed {
                detail: format!("listen failed: {}", e),
            })?;
        debug!(port, "listening");
        Ok(Self::from_parts(sock, use_ipv4_only, None))
    }

    /// Block until a connection arrives and return a socket for it, with the
    /// peer endpoint recorded.
    pub fn accept_connection(&self) -> Result<TcpSocket> {
        match self.sock.accept() {
            Ok((sock, addr)) => {
                let peer = addr
                    .as_socket()
                    .map(|sa| IpEndpoint::new(sa.ip().to_canonical(), sa.port()));
                debug!(?peer, "accepted connection");
                Ok(TcpSocket::from_parts(sock, self.use_ipv4_only, peer))
            }
            Err(e) => Err(self.map_io(e)),
        }
    }

    /// Select the byte-order policy for the typed integer I/O.
    pub fn set_network_byte_order(&self, enabled: bool) {
        self.network_byte_order.store(enabled, Ordering::Relaxed);
    }

    /// Select the 64-bit wire layout; see
    /// [`Transport::uses_split_u64`].
    pub fn set_split_u64(&self, enabled: bool) {
        self.split_u64.store(enabled, Ordering::Relaxed);
    }

    /// The locally bound endpoint (useful after binding port 0).
    pub fn local_endpoint(&self) -> Result<IpEndpoint> {
        let addr = self.sock.local_addr().map_err(NetError::from_io)?;
        let sa = addr
            .as_socket()
            .ok_or_else(|| NetError::Protocol("non-IP local address".into()))?;
        Ok(IpEndpoint::new(sa.ip().to_canonical(), sa.port()))
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    // Raw stream I/O for layered transports (TLS); errors are translated by
    // the caller.
    pub(crate) fn os_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.sock).read(buf)
    }

    pub(crate) fn os_write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.sock).write(buf)
    }

    // A kill from another thread invalidates the handle; errors observed
    // afterwards report as such rather than as whatever the OS chose.
    fn map_io(&self, e: io::Error) -> NetError {
        if self.is_killed() {
            return NetError::NotASocket;
        }
        NetError::from_io(e)
    }

    #[cfg(unix)]
    fn poll_readable(&self, timeout_ms: i32) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.sock.as_raw_fd(),
            events: POLL_READ_EVENTS,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd array of length 1 for the duration
        // of the call.
        let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if n < 0 {
            return Err(self.map_io(io::Error::last_os_error()));
        }
        if pfd.revents & libc::POLLERR != 0 {
            return Err(NetError::ConnectionReset);
        }
        Ok(n > 0 && (pfd.revents & POLL_READ_EVENTS) != 0)
    }
}

impl Transport for TcpSocket {
    fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(MAX_RW_CHUNK);
        match (&self.sock).read(&mut buf[..max]) {
            Ok(0) if self.is_killed() => Err(NetError::NotASocket),
            Ok(n) => Ok(n),
            Err(e) => Err(self.map_io(e)),
        }
    }

    fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let chunk = buf.len().min(MAX_RW_CHUNK);
            match (&self.sock).write(&buf[..chunk]) {
                Ok(0) => return Err(NetError::ConnectionReset),
                Ok(n) => buf = &buf[n..],
                Err(e) => return Err(self.map_io(e)),
            }
        }
        Ok(())
    }

    fn uses_network_byte_order(&self) -> bool {
        self.network_byte_order.load(Ordering::Relaxed)
    }

    fn uses_split_u64(&self) -> bool {
        self.split_u64.load(Ordering::Relaxed)
    }

    #[cfg(unix)]
    fn readable(&self, timeout: Duration) -> Result<bool> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        self.poll_readable(timeout_ms)
    }

    #[cfg(not(unix))]
    fn readable(&self, timeout: Duration) -> Result<bool> {
        // No poll on this platform: probe with a peek under a read timeout.
        let timeout = timeout.max(Duration::from_millis(1));
        self.sock
            .set_read_timeout(Some(timeout))
            .map_err(NetError::from_io)?;
        let mut probe = [std::mem::MaybeUninit::<u8>::uninit()];
        let result = self.sock.peek(&mut probe);
        let _ = self.sock.set_read_timeout(None);
        match result {
            Ok(_) => Ok(true),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(false)
            }
            Err(e) => Err(self.map_io(e)),
        }
    }

    #[cfg(target_os = "linux")]
    fn readable_or_event(&self, event: &EventFd) -> Result<bool> {
        let mut fds = [
            libc::pollfd {
                fd: self.sock.as_raw_fd(),
                events: POLL_READ_EVENTS,
                revents: 0,
            },
            libc::pollfd {
                fd: event.as_raw_fd(),
                events: POLL_READ_EVENTS,
                revents: 0,
            },
        ];
        // SAFETY: fds is a valid pollfd array of length 2 for the duration
        // of the call.
        let n = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        if n < 0 {
            return Err(self.map_io(io::Error::last_os_error()));
        }
        if fds[0].revents & libc::POLLERR != 0 || fds[1].revents & libc::POLLERR != 0 {
            return Err(NetError::ConnectionReset);
        }
        Ok(fds[0].revents & POLL_READ_EVENTS != 0)
    }

    fn start_graceful_shutdown(&self) {
        // Half-close the send side; the peer sees FIN.
        let _ = self.sock.shutdown(Shutdown::Write);
    }

    fn ungraceful_shutdown(&self) {
        if !self.killed.swap(true, Ordering::AcqRel) {
            let _ = self.sock.shutdown(Shutdown::Both);
            debug!("ungraceful shutdown");
        }
    }

    fn enable_tcp_keepalive(&self, period: Duration) -> Result<()> {
        let keepalive = TcpKeepalive::new().with_time(period.max(Duration::from_secs(1)));
        self.sock
            .set_tcp_keepalive(&keepalive)
            .map_err(NetError::from_io)
    }

    fn set_no_delay(&self, enabled: bool) -> Result<()> {
        self.sock.set_nodelay(enabled).map_err(NetError::from_io)
    }

    fn set_address_reuse(&self, enabled: bool) -> Result<()> {
        self.sock
            .set_reuse_address(enabled)
            .map_err(NetError::from_io)
    }

    fn peer_endpoint(&self) -> Option<IpEndpoint> {
        *self.peer.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        let _ = Networking::init();
    }

    #[test]
    fn test_connect_requires_init() {
        // Checked indirectly: new() after init succeeds.
        init();
        assert!(TcpSocket::new().is_ok());
    }

    #[test]
    fn test_bind_ephemeral_and_local_endpoint() {
        init();
        let listener = TcpSocket::bind_and_listen(0, true).unwrap();
        let local = listener.local_endpoint().unwrap();
        assert_ne!(local.port, 0);
    }

    #[test]
    fn test_connect_refused_maps_to_connection_failed() {
        init();
        let listener = TcpSocket::bind_and_listen(0, true).unwrap();
        let port = listener.local_endpoint().unwrap().port;
        drop(listener);

        let err = TcpSocket::connect("127.0.0.1", port).unwrap_err();
        assert!(
            matches!(err, NetError::ConnectionFailed { .. }),
            "got {:?}",
            err
        );
    }

    #[test]
    fn test_loopback_read_write() {
        init();
        let listener = TcpSocket::bind_and_listen(0, true).unwrap();
        let port = listener.local_endpoint().unwrap().port;

        let server = std::thread::spawn(move || {
            let conn = listener.accept_connection().unwrap();
            conn.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).unwrap();
            buf
        });

        let client = TcpSocket::connect("127.0.0.1", port).unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        client.write_all(b"pong").unwrap();

        assert_eq!(&server.join().unwrap(), b"pong");
    }

    #[test]
    fn test_peer_endpoint_recorded() {
        init();
        let listener = TcpSocket::bind_and_listen(0, true).unwrap();
        let port = listener.local_endpoint().unwrap().port;

        let server = std::thread::spawn(move || {
            let conn = listener.accept_connection().unwrap();
            conn.peer_endpoint()
        });

        let client = TcpSocket::connect("127.0.0.1", port).unwrap();
        assert_eq!(client.peer_endpoint().map(|e| e.port), Some(port));
        let accepted_peer = server.join().unwrap();
        assert!(accepted_peer.is_some());
        drop(client);
    }

    #[test]
    fn test_readable_timeout_on_idle_socket() {
        init();
        let listener = TcpSocket::bind_and_listen(0, true).unwrap();
        let port = listener.local_endpoint().unwrap().port;
        let client = TcpSocket::connect("127.0.0.1", port).unwrap();
        let _server = listener.accept_connection().unwrap();

        assert!(!client.readable(Duration::from_millis(20)).unwrap());
        _server.write_all(b"x").unwrap();
        assert!(client.readable(Duration::from_millis(500)).unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_readable_or_event_wakeup() {
        init();
        let listener = TcpSocket::bind_and_listen(0, true).unwrap();
        let port = listener.local_endpoint().unwrap().port;
        let client = std::sync::Arc::new(TcpSocket::connect("127.0.0.1", port).unwrap());
        let _server = listener.accept_connection().unwrap();

        let event = std::sync::Arc::new(EventFd::new().unwrap());
        let notifier = std::sync::Arc::clone(&event);
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify().unwrap();
        });

        // The event, not the socket, fires.
        assert!(!client.readable_or_event(&event).unwrap());
        waker.join().unwrap();
    }
}
