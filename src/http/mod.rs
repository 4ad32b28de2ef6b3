//! HTTP/1.1 client with persistent connections, `content-length` and chunked
//! bodies, redirects, streaming sinks and byte-size caps.
//!
//! The client is transport-agnostic: it talks to a [`SharedTransport`], which
//! is a TCP or TLS socket in production and an injected [`TestSocket`] in the
//! unit, property and fuzz suites.
//!
//! [`TestSocket`]: crate::test_socket::TestSocket

mod parse;
mod sink;
mod url;

pub use self::sink::{BufferSink, DataSink};
pub use self::url::Url;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{NetError, Result};
use crate::tcp::TcpSocket;
use crate::tls::{TlsOptions, TlsSocket};
use crate::transport::{SharedTransport, Transport};

use self::parse::{parse_hex_u64, parse_u64_dec, Parser};

// Scratch-buffer growth step while scanning for header/chunk terminators.
const HEADER_READ_CHUNK: usize = 2048;
// Per-iteration read size while draining bodies.
const BODY_READ_CHUNK: usize = 16 * 1024;
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(5);
const MAX_REDIRECTS: u32 = 10;

/// Status line and consumed header fields of a response.
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    /// The status code.
    pub response_code: i32,
    /// The reason phrase.
    pub response_message: String,
    /// The `Content-Type` value, empty when absent.
    pub mime_type: String,
}

/// Per-client configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HttpClientConfig {
    /// Maximum total body bytes accepted. Unlimited by default.
    pub max_data_size: u64,
    /// Cap on the scratch buffer holding header bytes and body tails.
    pub max_socket_buffer_size: usize,
    /// Reuse the connection across requests and enable TCP keep-alive.
    pub keepalive_socket: bool,
    /// Set `TCP_NODELAY` on new connections.
    pub enable_tcp_nodelay: bool,
    /// `User-Agent` header value, omitted when `None`.
    pub user_agent: Option<String>,
    /// Pre-formatted header lines, each without the trailing CRLF.
    pub additional_headers: Vec<String>,
    /// TLS knobs for `https` connections.
    pub tls: TlsOptions,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_data_size: u64::MAX,
            max_socket_buffer_size: 1 << 16,
            keepalive_socket: false,
            enable_tcp_nodelay: false,
            user_agent: None,
            additional_headers: Vec::new(),
            tls: TlsOptions::default(),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum RequestType {
    Get,
    Post,
}

fn check_scheme(scheme: &str) -> Result<()> {
    if scheme == "http" || scheme == "https" {
        Ok(())
    } else {
        Err(NetError::InvalidScheme(scheme.to_string()))
    }
}

/// A blocking HTTP/1.1 client.
///
/// A failed request leaves the connection in an undefined state; call
/// [`HttpClient::reset_connection`] before retrying. [`HttpClient::kill`] may
/// be called from any thread at any point.
pub struct HttpClient {
    /// Per-client configuration, applied at the next request.
    pub config: HttpClientConfig,
    /// Injection point: when set, requests run over this transport instead
    /// of opening real connections.
    pub test_socket: Option<SharedTransport>,
    // Shared with kill handles; the I/O thread clones the Arc out and never
    // holds the lock across a blocking call.
    socket: Arc<Mutex<Option<SharedTransport>>>,
    socket_buffer: Vec<u8>,
    connected_scheme: String,
    connected_host: String,
    connected_port: Option<u16>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// A client with default configuration.
    pub fn new() -> Self {
        Self::with_config(HttpClientConfig::default())
    }

    /// A client with the given configuration.
    pub fn with_config(config: HttpClientConfig) -> Self {
        Self {
            config,
            test_socket: None,
            socket: Arc::new(Mutex::new(None)),
            socket_buffer: Vec::new(),
            connected_scheme: String::new(),
            connected_host: String::new(),
            connected_port: None,
        }
    }

    /// A cloneable handle that can cancel this client's in-flight request
    /// from another thread, outliving any borrow of the client itself.
    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            socket: Arc::clone(&self.socket),
        }
    }

    /// Open a connection to `scheme://host[:port]`, dropping any existing
    /// one. `port` of `None` selects the scheme default (80 or 443).
    pub fn connect(&mut self, scheme: &str, host: &str, port: Option<u16>) -> Result<()> {
        *self.socket.lock() = None;
        self.connected_scheme.clear();
        self.connected_host.clear();
        self.connected_port = None;

        check_scheme(scheme)?;

        let transport: SharedTransport = if let Some(test) = &self.test_socket {
            Arc::clone(test)
        } else if scheme == "https" {
            let plain = Arc::new(TcpSocket::new()?);
            // Publish the plain socket before connecting so kill() can
            // interrupt the connect and the handshake.
            *self.socket.lock() = Some(plain.clone() as SharedTransport);
            plain.connect_to_host(host, port.unwrap_or(443))?;
            if self.config.enable_tcp_nodelay {
                plain.set_no_delay(true)?;
            }
            Arc::new(TlsSocket::connect(plain, &self.config.tls, host)?)
        } else {
            let plain = Arc::new(TcpSocket::new()?);
            *self.socket.lock() = Some(plain.clone() as SharedTransport);
            plain.connect_to_host(host, port.unwrap_or(80))?;
            if self.config.enable_tcp_nodelay {
                plain.set_no_delay(true)?;
            }
            plain
        };

        if self.config.keepalive_socket {
            transport.enable_tcp_keepalive(KEEPALIVE_PERIOD)?;
        }

        *self.socket.lock() = Some(Arc::clone(&transport));
        self.connected_scheme = scheme.to_string();
        self.connected_host = host.to_string();
        self.connected_port = port;
        debug!(scheme, host, ?port, "connected");
        Ok(())
    }

    /// [`HttpClient::connect`] with connection reuse turned on first.
    pub fn connect_and_enable_keepalive(
        &mut self,
        scheme: &str,
        host: &str,
        port: Option<u16>,
    ) -> Result<()> {
        self.config.keepalive_socket = true;
        self.connect(scheme, host, port)
    }

    /// Drop the connection and the scratch buffer. Required after a failed
    /// request before the client is used again.
    pub fn reset_connection(&mut self) {
        *self.socket.lock() = None;
        self.socket_buffer.clear();
    }

    /// Force any blocked request on this client to fail. Callable from any
    /// thread.
    pub fn kill(&self) {
        let socket = self.socket.lock().clone();
        if let Some(socket) = socket {
            socket.ungraceful_shutdown();
        }
    }
}

/// Cancels a client's in-flight request from any thread; see
/// [`HttpClient::kill_handle`].
#[derive(Clone)]
pub struct KillHandle {
    socket: Arc<Mutex<Option<SharedTransport>>>,
}

impl KillHandle {
    /// Invalidate the client's current socket, without removing it, so the
    /// blocked I/O call returns with an error.
    pub fn kill(&self) {
        let socket = self.socket.lock().clone();
        if let Some(socket) = socket {
            socket.ungraceful_shutdown();
        }
    }
}

impl HttpClient {
    /// GET `url`, streaming the body into `sink`.
    pub fn download_file(
        &mut self,
        url: &str,
        sink: &mut dyn DataSink,
    ) -> Result<ResponseInfo> {
        self.do_download_file(url, 0, sink)
    }

    /// GET `url`, aggregating the body (bounded by `max_data_size`).
    pub fn get(&mut self, url: &str) -> Result<(ResponseInfo, Vec<u8>)> {
        let mut sink = BufferSink::new(self.config.max_data_size);
        let info = self.do_download_file(url, 0, &mut sink)?;
        Ok((info, sink.into_inner()))
    }

    /// POST `body` to `url`, streaming the response body into `sink`.
    pub fn send_post(
        &mut self,
        url: &str,
        post_content: &[u8],
        content_type: &str,
        sink: &mut dyn DataSink,
    ) -> Result<ResponseInfo> {
        self.socket_buffer.clear();

        let url = Url::parse(url)?;
        check_scheme(&url.scheme)?;
        self.ensure_connected(&url)?;

        let mut request = String::with_capacity(2048);
        request.push_str("POST ");
        request.push_str(&url.path_and_query());
        request.push_str(" HTTP/1.1\r\nHost: ");
        request.push_str(&url.host);
        request.push_str("\r\nContent-Type: ");
        request.push_str(content_type);
        request.push_str("\r\nContent-Length: ");
        request.push_str(&post_content.len().to_string());
        request.push_str("\r\n");
        if let Some(agent) = &self.config.user_agent {
            request.push_str("User-Agent: ");
            request.push_str(agent);
            request.push_str("\r\n");
        }
        for header in &self.config.additional_headers {
            request.push_str(header);
            request.push_str("\r\n");
        }
        request.push_str("Connection: ");
        request.push_str(if self.config.keepalive_socket {
            "Keep-Alive"
        } else {
            "Close"
        });
        request.push_str("\r\n\r\n");

        let socket = self.current_socket()?;
        socket.write_all(request.as_bytes())?;
        socket.write_all(post_content)?;

        let header_end = self.read_until_terminator(0, b"\r\n\r\n")?;
        self.handle_response(header_end, RequestType::Post, 0, sink)
    }

    /// POST `body` to `url`, aggregating the response body.
    pub fn post(
        &mut self,
        url: &str,
        post_content: &[u8],
        content_type: &str,
    ) -> Result<(ResponseInfo, Vec<u8>)> {
        let mut sink = BufferSink::new(self.config.max_data_size);
        let info = self.send_post(url, post_content, content_type, &mut sink)?;
        Ok((info, sink.into_inner()))
    }

    fn ensure_connected(&mut self, url: &Url) -> Result<()> {
        let connected = self.socket.lock().is_some();
        if !connected
            || self.connected_scheme != url.scheme
            || self.connected_host != url.host
            || self.connected_port != url.port
        {
            self.connect(&url.scheme, &url.host, url.port)?;
        }
        Ok(())
    }

    fn current_socket(&self) -> Result<SharedTransport> {
        self.socket
            .lock()
            .clone()
            .ok_or_else(|| NetError::ConnectionFailed {
                detail: "no connection open".into(),
            })
    }

    fn do_download_file(
        &mut self,
        url: &str,
        num_redirects_done: u32,
        sink: &mut dyn DataSink,
    ) -> Result<ResponseInfo> {
        self.socket_buffer.clear();
        if num_redirects_done > MAX_REDIRECTS {
            return Err(NetError::TooManyRedirects);
        }

        let url = Url::parse(url)?;
        check_scheme(&url.scheme)?;
        self.ensure_connected(&url)?;

        let mut request = String::with_capacity(2048);
        request.push_str("GET ");
        request.push_str(&url.path_and_query());
        request.push_str(" HTTP/1.1\r\nHost: ");
        request.push_str(&url.host);
        request.push_str("\r\n");
        if let Some(agent) = &self.config.user_agent {
            request.push_str("User-Agent: ");
            request.push_str(agent);
            request.push_str("\r\n");
        }
        for header in &self.config.additional_headers {
            request.push_str(header);
            request.push_str("\r\n");
        }
        request.push_str("Connection: ");
        request.push_str(if self.config.keepalive_socket {
            "Keep-Alive"
        } else {
            "Close"
        });
        request.push_str("\r\n\r\n");

        let socket = self.current_socket()?;
        socket.write_all(request.as_bytes())?;

        let header_end = self.read_until_terminator(0, b"\r\n\r\n")?;
        self.handle_response(header_end, RequestType::Get, num_redirects_done, sink)
    }

    // Scan the scratch buffer for `terminator` at or after `scan_start`,
    // reading more data as needed, and return the index just past it. The
    // scan cursor never revisits already-scanned bytes.
    fn read_until_terminator(&mut self, scan_start: usize, terminator: &[u8]) -> Result<usize> {
        let socket = self.current_socket()?;
        let mut scan = scan_start;
        loop {
            let len = self.socket_buffer.len();
            while scan + terminator.len() <= len {
                if self.socket_buffer[scan..scan + terminator.len()] == *terminator {
                    return Ok(scan + terminator.len());
                }
                scan += 1;
            }

            let old_len = self.socket_buffer.len();
            let new_len = old_len
                .checked_add(HEADER_READ_CHUNK)
                .ok_or_else(|| NetError::Protocol("scratch buffer overflow".into()))?;
            if new_len > self.config.max_socket_buffer_size {
                return Err(NetError::Protocol(format!(
                    "exceeded max socket buffer size ({} B)",
                    self.config.max_socket_buffer_size
                )));
            }
            self.socket_buffer.resize(new_len, 0);
            let n = socket.read_some(&mut self.socket_buffer[old_len..])?;
            self.socket_buffer.truncate(old_len + n);
            if n == 0 {
                // Closed before the terminator arrived.
                return Err(NetError::ConnectionClosed);
            }
        }
    }

    // Handle the response whose header occupies
    // `socket_buffer[..response_header_size]`.
    fn handle_response(
        &mut self,
        response_header_size: usize,
        request_type: RequestType,
        num_redirects_done: u32,
        sink: &mut dyn DataSink,
    ) -> Result<ResponseInfo> {
        debug_assert!(response_header_size > 0);
        debug_assert!(response_header_size <= self.socket_buffer.len());

        let mut info = ResponseInfo::default();
        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        let mut location: Option<String> = None;

        {
            let mut parser = Parser::new(&self.socket_buffer[..response_header_size]);

            if !parser.parse_literal(b"HTTP/") {
                return Err(NetError::Protocol("failed to parse HTTP version".into()));
            }
            parser
                .parse_u32()
                .ok_or_else(|| NetError::Protocol("failed to parse HTTP major version".into()))?;
            if !parser.parse_literal(b".") {
                return Err(NetError::Protocol("failed to parse HTTP version".into()));
            }
            parser
                .parse_u32()
                .ok_or_else(|| NetError::Protocol("failed to parse HTTP minor version".into()))?;
            parser.skip_spaces();

            info.response_code = parser
                .parse_i32()
                .ok_or_else(|| NetError::Protocol("failed to parse response code".into()))?;
            let message = parser
                .parse_to_byte(b'\r')
                .ok_or_else(|| NetError::Protocol("failed to parse response message".into()))?;
            info.response_message = String::from_utf8_lossy(message).into_owned();
            parser.advance();
            if !parser.parse_literal(b"\n") {
                return Err(NetError::Protocol("malformed status line ending".into()));
            }

            loop {
                if parser.eof() {
                    return Err(NetError::Protocol("truncated header fields".into()));
                }
                if parser.current_is(b'\r') {
                    break;
                }

                let name = parser
                    .parse_to_byte(b':')
                    .ok_or_else(|| NetError::Protocol("malformed header field name".into()))?;
                parser.advance();
                // A single space after the colon is consumed if present.
                if parser.current_is(b' ') {
                    parser.advance();
                }
                let value = parser
                    .parse_to_byte(b'\r')
                    .ok_or_else(|| NetError::Protocol("malformed header field value".into()))?;
                parser.advance();
                if !parser.parse_literal(b"\n") {
                    return Err(NetError::Protocol("malformed header line ending".into()));
                }

                if name.eq_ignore_ascii_case(b"content-length") {
                    let parsed = parse_u64_dec(value).ok_or_else(|| {
                        NetError::Protocol("failed to parse content length".into())
                    })?;
                    content_length = Some(parsed);
                } else if name.eq_ignore_ascii_case(b"content-type") {
                    info.mime_type = String::from_utf8_lossy(value).into_owned();
                } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
                    if value == b"chunked" {
                        chunked = true;
                    }
                } else if name.eq_ignore_ascii_case(b"location") {
                    location = Some(String::from_utf8_lossy(value).into_owned());
                }
            }
            parser.advance();
            if !parser.parse_literal(b"\n") {
                return Err(NetError::Protocol("malformed header terminator".into()));
            }
        }

        if info.response_code == 301 || info.response_code == 302 {
            let location = location.unwrap_or_default();
            if location.is_empty() {
                return Err(NetError::Protocol("redirect location was empty".into()));
            }
            return match request_type {
                RequestType::Get => {
                    debug!(%location, "following redirect");
                    self.do_download_file(&location, num_redirects_done + 1, sink)
                }
                RequestType::Post => Err(NetError::Unsupported("redirect of a POST request")),
            };
        }

        if let Some(content_length) = content_length {
            self.read_fixed_length_body(response_header_size, content_length, &info, sink)?;
        } else if chunked {
            self.read_chunked_body(response_header_size, &info, sink)?;
        } else {
            self.read_close_delimited_body(response_header_size, &info, sink)?;
        }

        Ok(info)
    }

    fn read_fixed_length_body(
        &mut self,
        response_header_size: usize,
        content_length: u64,
        info: &ResponseInfo,
        sink: &mut dyn DataSink,
    ) -> Result<()> {
        if content_length > self.config.max_data_size {
            return Err(NetError::SizeLimitExceeded {
                size: content_length,
                limit: self.config.max_data_size,
            });
        }
        sink.have_content_length(content_length)?;

        // Body bytes already read into the scratch buffer behind the header.
        let buffered = (self.socket_buffer.len() - response_header_size) as u64;
        let use_now = buffered.min(content_length);
        if use_now > 0 {
            let start = response_header_size;
            let end = start + use_now as usize;
            sink.handle_data(&self.socket_buffer[start..end], info)?;
        }

        let socket = self.current_socket()?;
        let mut remaining = content_length - use_now;
        while remaining > 0 {
            let read_size = remaining.min(BODY_READ_CHUNK as u64) as usize;
            self.socket_buffer.resize(read_size, 0);
            socket.read_exact(&mut self.socket_buffer[..read_size])?;
            sink.handle_data(&self.socket_buffer[..read_size], info)?;
            remaining -= read_size as u64;
        }
        Ok(())
    }

    fn read_chunked_body(
        &mut self,
        response_header_size: usize,
        info: &ResponseInfo,
        sink: &mut dyn DataSink,
    ) -> Result<()> {
        let mut chunk_line_start = response_header_size;
        loop {
            let chunk_line_end = self.read_until_terminator(chunk_line_start, b"\r\n")?;

            let line = &self.socket_buffer[chunk_line_start..chunk_line_end];
            // Trim the CRLF, then drop any ;-delimited extensions.
            let size_digits = &line[..line.len() - 2];
            let size_digits = match size_digits.iter().position(|&b| b == b';') {
                Some(i) => &size_digits[..i],
                None => size_digits,
            };
            let chunk_size = parse_hex_u64(size_digits)
                .ok_or_else(|| NetError::Protocol("failed to parse chunk size".into()))?;

            if chunk_size == 0 {
                // Finished; footers follow but are ignored.
                return Ok(());
            }

            // Ensure the buffer holds the chunk body plus its trailing CRLF.
            let chunk_and_crlf = chunk_size
                .checked_add(2)
                .ok_or_else(|| NetError::Protocol("chunk size overflow".into()))?;
            let required = (chunk_line_end as u64)
                .checked_add(chunk_and_crlf)
                .ok_or_else(|| NetError::Protocol("chunk size overflow".into()))?;
            if required > self.config.max_socket_buffer_size as u64 {
                return Err(NetError::Protocol(format!(
                    "exceeded max socket buffer size ({} B)",
                    self.config.max_socket_buffer_size
                )));
            }
            let required = required as usize;
            if self.socket_buffer.len() < required {
                let current = self.socket_buffer.len();
                self.socket_buffer.resize(required, 0);
                let socket = self.current_socket()?;
                socket.read_exact(&mut self.socket_buffer[current..required])?;
            }

            let chunk_end = chunk_line_end + chunk_size as usize;
            sink.handle_data(&self.socket_buffer[chunk_line_end..chunk_end], info)?;

            chunk_line_start = chunk_end + 2;
        }
    }

    // No valid content length and not chunked: read until the server closes.
    fn read_close_delimited_body(
        &mut self,
        response_header_size: usize,
        info: &ResponseInfo,
        sink: &mut dyn DataSink,
    ) -> Result<()> {
        let buffered = (self.socket_buffer.len() - response_header_size) as u64;
        if buffered > self.config.max_data_size {
            return Err(NetError::SizeLimitExceeded {
                size: buffered,
                limit: self.config.max_data_size,
            });
        }
        if buffered > 0 {
            sink.handle_data(&self.socket_buffer[response_header_size..], info)?;
        }

        let socket = self.current_socket()?;
        let mut total = buffered;
        loop {
            self.socket_buffer.resize(BODY_READ_CHUNK, 0);
            let n = socket.read_some(&mut self.socket_buffer[..BODY_READ_CHUNK])?;
            if n == 0 {
                return Ok(());
            }
            total += n as u64;
            if total > self.config.max_data_size {
                return Err(NetError::SizeLimitExceeded {
                    size: total,
                    limit: self.config.max_data_size,
                });
            }
            sink.handle_data(&self.socket_buffer[..n], info)?;
        }
    }
}
