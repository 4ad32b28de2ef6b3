//! TLS decoration of an established TCP socket.
//!
//! Construction performs the handshake so that failures surface to the
//! caller that opened the socket rather than to a later reader. Partial-I/O
//! signals from the TLS engine are retried internally and never reported as
//! errors.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use tracing::debug;

use crate::endpoint::IpEndpoint;
use crate::error::{NetError, Result};
#[cfg(target_os = "linux")]
use crate::event_fd::EventFd;
use crate::tcp::TcpSocket;
use crate::transport::{Transport, MAX_RW_CHUNK};

fn tls_err(e: rustls::Error) -> NetError {
    NetError::Tls {
        detail: e.to_string(),
    }
}

/// TLS client configuration knobs.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TlsOptions {
    /// Verify the server certificate chain against the platform trust roots.
    /// On by default; test and fuzz harnesses may disable it.
    pub verify_certificates: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify_certificates: true,
        }
    }
}

impl TlsOptions {
    /// Options with certificate verification disabled.
    pub fn insecure() -> Self {
        Self {
            verify_certificates: false,
        }
    }

    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>> {
        if self.verify_certificates {
            let mut roots = RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();
            for cert in native.certs {
                // Unparseable platform certificates are skipped rather than
                // failing the whole store.
                let _ = roots.add(cert);
            }
            if !native.errors.is_empty() {
                debug!(
                    errors = native.errors.len(),
                    "some platform trust roots failed to load"
                );
            }
            Ok(Arc::new(
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            ))
        } else {
            Ok(Arc::new(
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
                    .with_no_client_auth(),
            ))
        }
    }
}

/// Certificate verifier that accepts everything. Only reachable through
/// [`TlsOptions::insecure`].
#[derive(Debug)]
struct NoVerification {
    schemes: Vec<rustls::SignatureScheme>,
}

impl NoVerification {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
    {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
    {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

/// Build a server-side TLS configuration from PEM-encoded certificate chain
/// and private key bytes.
pub fn load_server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut io::Cursor::new(cert_pem))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| NetError::Tls {
                detail: format!("failed to parse certificate PEM: {}", e),
            })?;
    if certs.is_empty() {
        return Err(NetError::Tls {
            detail: "no certificates in PEM input".into(),
        });
    }
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut io::Cursor::new(key_pem))
            .map_err(|e| NetError::Tls {
                detail: format!("failed to parse key PEM: {}", e),
            })?
            .ok_or_else(|| NetError::Tls {
                detail: "no private key in PEM input".into(),
            })?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_err)?;
    Ok(Arc::new(config))
}

// Raw-stream adapter handed to the TLS engine. The engine sees the plain
// socket's OS-level reads and writes; error translation happens above it.
struct PlainIo<'a>(&'a TcpSocket);

impl Read for PlainIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.os_read(buf)
    }
}

impl Write for PlainIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.os_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A TLS connection over a plain [`TcpSocket`].
///
/// The plain socket's handle stays valid for the full lifetime of the TLS
/// engine; option and readiness calls delegate to it.
#[derive(Debug)]
pub struct TlsSocket {
    plain: Arc<TcpSocket>,
    conn: Mutex<Connection>,
}

impl TlsSocket {
    /// Wrap an established socket in a TLS client connection to
    /// `server_name` and complete the handshake.
    pub fn connect(
        plain: Arc<TcpSocket>,
        options: &TlsOptions,
        server_name: &str,
    ) -> Result<Self> {
        let config = options.client_config()?;
        let name = ServerName::try_from(server_name.to_string()).map_err(|_| {
            NetError::Tls {
                detail: format!("invalid server name '{}'", server_name),
            }
        })?;
        let conn = ClientConnection::new(config, name).map_err(tls_err)?;
        let socket = Self {
            plain,
            conn: Mutex::new(Connection::Client(conn)),
        };
        socket.complete_handshake()?;
        Ok(socket)
    }

    /// Wrap an accepted socket in a TLS server connection using a pre-built
    /// configuration and complete the handshake.
    pub fn accept_with_config(
        plain: Arc<TcpSocket>,
        config: Arc<ServerConfig>,
    ) -> Result<Self> {
        let conn = ServerConnection::new(config).map_err(tls_err)?;
        let socket = Self {
            plain,
            conn: Mutex::new(Connection::Server(conn)),
        };
        socket.complete_handshake()?;
        Ok(socket)
    }

    /// The wrapped plain socket.
    pub fn plain_socket(&self) -> &Arc<TcpSocket> {
        &self.plain
    }

    fn complete_handshake(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let mut io = PlainIo(&self.plain);
        while conn.is_handshaking() {
            while conn.wants_write() {
                conn.write_tls(&mut io).map_err(NetError::from_io)?;
            }
            if conn.is_handshaking() && conn.wants_read() {
                let n = conn.read_tls(&mut io).map_err(NetError::from_io)?;
                if n == 0 {
                    return Err(NetError::Tls {
                        detail: "peer closed connection during handshake".into(),
                    });
                }
                conn.process_new_packets().map_err(tls_err)?;
            }
        }
        while conn.wants_write() {
            conn.write_tls(&mut io).map_err(NetError::from_io)?;
        }
        Ok(())
    }

    // Flush pending engine output, then pull one batch of ciphertext.
    // Returns the ciphertext byte count; 0 means the peer closed the stream.
    fn pump(&self, conn: &mut Connection, io: &mut PlainIo<'_>) -> Result<usize> {
        while conn.wants_write() {
            conn.write_tls(io).map_err(NetError::from_io)?;
        }
        let n = conn.read_tls(io).map_err(NetError::from_io)?;
        if n > 0 {
            conn.process_new_packets().map_err(tls_err)?;
            while conn.wants_write() {
                conn.write_tls(io).map_err(NetError::from_io)?;
            }
        }
        Ok(n)
    }
}

impl Transport for TlsSocket {
    fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(MAX_RW_CHUNK);
        let mut conn = self.conn.lock();
        let mut io = PlainIo(&self.plain);
        loop {
            match conn.reader().read(&mut buf[..max]) {
                Ok(n) => return Ok(n),
                // No plaintext buffered yet: pull more ciphertext below.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                // Stream ended without a close_notify.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(NetError::from_io(e)),
            }
            if self.pump(&mut conn, &mut io)? == 0 {
                if self.plain.is_killed() {
                    return Err(NetError::NotASocket);
                }
                return Ok(0);
            }
        }
    }

    fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut conn = self.conn.lock();
        let mut io = PlainIo(&self.plain);
        let mut offset = 0;
        while offset < buf.len() {
            let chunk = (buf.len() - offset).min(MAX_RW_CHUNK);
            let n = conn
                .writer()
                .write(&buf[offset..offset + chunk])
                .map_err(NetError::from_io)?;
            if n == 0 {
                return Err(NetError::ConnectionReset);
            }
            offset += n;
            while conn.wants_write() {
                conn.write_tls(&mut io).map_err(NetError::from_io)?;
            }
        }
        Ok(())
    }

    // Delegates to the plain socket, so plaintext already buffered in the
    // TLS engine is not considered.
    fn readable(&self, timeout: Duration) -> Result<bool> {
        self.plain.readable(timeout)
    }

    #[cfg(target_os = "linux")]
    fn readable_or_event(&self, event: &EventFd) -> Result<bool> {
        self.plain.readable_or_event(event)
    }

    fn start_graceful_shutdown(&self) {
        let mut conn = self.conn.lock();
        conn.send_close_notify();
        let mut io = PlainIo(&self.plain);
        while conn.wants_write() {
            if conn.write_tls(&mut io).is_err() {
                break;
            }
        }
        self.plain.start_graceful_shutdown();
    }

    fn ungraceful_shutdown(&self) {
        self.plain.ungraceful_shutdown();
    }

    fn enable_tcp_keepalive(&self, period: Duration) -> Result<()> {
        self.plain.enable_tcp_keepalive(period)
    }

    fn set_no_delay(&self, enabled: bool) -> Result<()> {
        self.plain.set_no_delay(enabled)
    }

    fn set_address_reuse(&self, enabled: bool) -> Result<()> {
        self.plain.set_address_reuse(enabled)
    }

    fn peer_endpoint(&self) -> Option<IpEndpoint> {
        self.plain.peer_endpoint()
    }
}

impl Drop for TlsSocket {
    fn drop(&mut self) {
        // Skip the close_notify when the handle was killed from another
        // thread; the write would fail and must not panic here.
        if self.plain.is_killed() {
            return;
        }
        let conn = self.conn.get_mut();
        conn.send_close_notify();
        let mut io = PlainIo(&self.plain);
        while conn.wants_write() {
            match conn.write_tls(&mut io) {
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "close_notify write failed");
                    break;
                }
            }
        }
        self.plain.start_graceful_shutdown();
    }
}
