//! Unified error handling for the networking layer.
//!
//! Every transport, the framing layer and the HTTP client report failures
//! through a single [`NetError`] taxonomy. OS error-code translation is
//! concentrated here so the per-platform mapping lives in exactly one place.

use std::io;
use thiserror::Error;

/// Convenience type alias for Results using [`NetError`].
pub type Result<T, E = NetError> = std::result::Result<T, E>;

/// Errors raised by sockets, framing and the HTTP client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NetError {
    /// Hostname could not be resolved.
    #[error("failed to resolve hostname '{hostname}': {source}")]
    Dns {
        /// The hostname that failed to resolve.
        hostname: String,
        /// The underlying resolver error.
        #[source]
        source: io::Error,
    },

    /// Synchronous OS-level connect failure (refused, unreachable, ...).
    #[error("connection failed: {detail}")]
    ConnectionFailed {
        /// Human-readable description including host and endpoint.
        detail: String,
    },

    /// Peer RST or transport failure mid-stream.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Graceful close encountered where data was required.
    #[error("connection closed")]
    ConnectionClosed,

    /// A blocking call was cancelled.
    #[error("blocking call interrupted")]
    Interrupted,

    /// The socket handle was invalidated by another thread while blocked.
    #[error("socket handle closed")]
    NotASocket,

    /// A socket was used before `Networking::init()`.
    #[error("networking subsystem not initialised")]
    NotInitialised,

    /// `Networking::init()` was called twice without a shutdown.
    #[error("networking subsystem already initialised")]
    AlreadyInitialised,

    /// URL scheme outside the supported set.
    #[error("invalid scheme '{0}'")]
    InvalidScheme(String),

    /// Malformed HTTP header, bad chunk size, bad packet length, scratch
    /// buffer exceeded, or invalid UTF-8 where text was required.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Body or buffer above a configured cap.
    #[error("size of {size} B exceeded limit of {limit} B")]
    SizeLimitExceeded {
        /// Observed or declared size.
        size: u64,
        /// The configured cap.
        limit: u64,
    },

    /// HTTP redirect hop count exceeded.
    #[error("too many redirects")]
    TooManyRedirects,

    /// A length-bounded string read ran past its limit.
    #[error("string too long: exceeded {limit} bytes")]
    StringTooLong {
        /// The configured maximum length.
        limit: usize,
    },

    /// Any TLS-library-reported failure, with the library's message.
    #[error("TLS error: {detail}")]
    Tls {
        /// The TLS library's error string.
        detail: String,
    },

    /// Operation not available on this transport.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Other OS errors, with the OS message attached.
    #[error("network error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Get a static error code string for log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Dns { .. } => "dns_failure",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::ConnectionReset => "connection_reset",
            Self::ConnectionClosed => "connection_closed",
            Self::Interrupted => "interrupted",
            Self::NotASocket => "not_a_socket",
            Self::NotInitialised => "not_initialised",
            Self::AlreadyInitialised => "already_initialised",
            Self::InvalidScheme(_) => "invalid_scheme",
            Self::Protocol(_) => "protocol_error",
            Self::SizeLimitExceeded { .. } => "size_limit_exceeded",
            Self::TooManyRedirects => "too_many_redirects",
            Self::StringTooLong { .. } => "string_too_long",
            Self::Tls { .. } => "tls_error",
            Self::Unsupported(_) => "unsupported",
            Self::Io(_) => "unspecified",
        }
    }

    /// Translate an OS-level I/O error into the taxonomy.
    ///
    /// Raw error codes are consulted first: a handle invalidated by another
    /// thread surfaces as `EBADF`/`ENOTSOCK` on POSIX and `WSAENOTSOCK` on
    /// Winsock, before the portable `ErrorKind` mapping applies.
    pub(crate) fn from_io(e: io::Error) -> Self {
        #[cfg(unix)]
        if let Some(code) = e.raw_os_error() {
            if code == libc::EBADF || code == libc::ENOTSOCK {
                return NetError::NotASocket;
            }
        }
        #[cfg(windows)]
        if let Some(code) = e.raw_os_error() {
            const WSAEINTR: i32 = 10004;
            const WSAENOTSOCK: i32 = 10038;
            match code {
                WSAEINTR => return NetError::Interrupted,
                WSAENOTSOCK => return NetError::NotASocket,
                _ => {}
            }
        }
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => NetError::ConnectionReset,
            io::ErrorKind::Interrupted => NetError::Interrupted,
            io::ErrorKind::ConnectionRefused => NetError::ConnectionFailed {
                detail: e.to_string(),
            },
            _ => NetError::Io(e),
        }
    }

    /// Capture and translate the calling thread's most recent OS error.
    pub(crate) fn last_os_error() -> Self {
        Self::from_io(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(NetError::ConnectionReset.error_code(), "connection_reset");
        assert_eq!(NetError::TooManyRedirects.error_code(), "too_many_redirects");
        assert_eq!(
            NetError::Protocol("bad chunk".into()).error_code(),
            "protocol_error"
        );
    }

    #[test]
    fn test_from_io_kind_mapping() {
        let e = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(NetError::from_io(e), NetError::ConnectionReset));

        let e = io::Error::new(io::ErrorKind::Interrupted, "signal");
        assert!(matches!(NetError::from_io(e), NetError::Interrupted));

        let e = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            NetError::from_io(e),
            NetError::ConnectionFailed { .. }
        ));

        let e = io::Error::new(io::ErrorKind::Other, "something else");
        assert!(matches!(NetError::from_io(e), NetError::Io(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_from_io_raw_code_mapping() {
        let e = io::Error::from_raw_os_error(libc::EBADF);
        assert!(matches!(NetError::from_io(e), NetError::NotASocket));

        let e = io::Error::from_raw_os_error(libc::ENOTSOCK);
        assert!(matches!(NetError::from_io(e), NetError::NotASocket));
    }

    #[test]
    fn test_display_includes_detail() {
        let err = NetError::SizeLimitExceeded {
            size: 100,
            limit: 4,
        };
        assert_eq!(format!("{}", err), "size of 100 B exceeded limit of 4 B");
    }
}
