//! The blocking transport abstraction shared by TCP, TLS, WebSocket and
//! in-memory test sockets.
//!
//! The HTTP client and the packet framing layer are transport-agnostic and
//! talk to a [`SharedTransport`]. Sharing is by atomic reference count so a
//! killer thread can hold the socket while the owning thread blocks in I/O;
//! every method therefore takes `&self` and implementations use interior
//! mutability for their mutable state.

use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::IpEndpoint;
use crate::error::{NetError, Result};
#[cfg(target_os = "linux")]
use crate::event_fd::EventFd;

/// Per-OS-call ceiling for reads and writes.
///
/// Large transfers are looped in chunks of this size so the kernel queue is
/// never handed an unbounded buffer.
pub const MAX_RW_CHUNK: usize = 8 * 1024 * 1024;

/// Shared, killable handle to a transport.
pub type SharedTransport = Arc<dyn Transport>;

/// A blocking byte-stream transport.
///
/// Blocking calls have no per-call timeouts; callers that need one use
/// [`Transport::readable`] first. Every blocking call is cancellable by
/// [`Transport::ungraceful_shutdown`], and only by it.
pub trait Transport: Send + Sync {
    /// Read 1 or more bytes, up to `buf.len()`. Blocks until at least one
    /// byte is available. Returns 0 only when the peer closed gracefully.
    fn read_some(&self, buf: &mut [u8]) -> Result<usize>;

    /// Read exactly `buf.len()` bytes.
    ///
    /// A graceful close mid-read fails with [`NetError::ConnectionClosed`].
    fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..])?;
            if n == 0 {
                return Err(NetError::ConnectionClosed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Write all of `buf`, retrying partial transport-level writes.
    fn write_all(&self, buf: &[u8]) -> Result<()>;

    /// Whether multi-byte integers travel big-endian (the default).
    fn uses_network_byte_order(&self) -> bool {
        true
    }

    /// Whether 64-bit integers travel as two 32-bit halves in host memory
    /// order. This is the layout of the existing wire protocol; new
    /// protocols can switch a socket to a single big-endian 64-bit layout.
    fn uses_split_u64(&self) -> bool {
        true
    }

    /// Read a single byte.
    fn read_u8(&self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Write a single byte.
    fn write_u8(&self, x: u8) -> Result<()> {
        self.write_all(&[x])
    }

    /// Read a 16-bit unsigned integer under the socket's byte-order policy.
    fn read_u16(&self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(if self.uses_network_byte_order() {
            u16::from_be_bytes(buf)
        } else {
            u16::from_ne_bytes(buf)
        })
    }

    /// Write a 16-bit unsigned integer under the socket's byte-order policy.
    fn write_u16(&self, x: u16) -> Result<()> {
        if self.uses_network_byte_order() {
            self.write_all(&x.to_be_bytes())
        } else {
            self.write_all(&x.to_ne_bytes())
        }
    }

    /// Read a 32-bit signed integer under the socket's byte-order policy.
    fn read_i32(&self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(if self.uses_network_byte_order() {
            i32::from_be_bytes(buf)
        } else {
            i32::from_ne_bytes(buf)
        })
    }

    /// Write a 32-bit signed integer under the socket's byte-order policy.
    fn write_i32(&self, x: i32) -> Result<()> {
        if self.uses_network_byte_order() {
            self.write_all(&x.to_be_bytes())
        } else {
            self.write_all(&x.to_ne_bytes())
        }
    }

    /// Read a 32-bit unsigned integer under the socket's byte-order policy.
    fn read_u32(&self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(if self.uses_network_byte_order() {
            u32::from_be_bytes(buf)
        } else {
            u32::from_ne_bytes(buf)
        })
    }

    /// Write a 32-bit unsigned integer under the socket's byte-order policy.
    fn write_u32(&self, x: u32) -> Result<()> {
        if self.uses_network_byte_order() {
            self.write_all(&x.to_be_bytes())
        } else {
            self.write_all(&x.to_ne_bytes())
        }
    }

    /// Read a 64-bit unsigned integer.
    ///
    /// Under the network-byte-order policy the value arrives either as two
    /// 32-bit big-endian halves in host memory order (see
    /// [`Transport::uses_split_u64`]) or as a single big-endian 64-bit value.
    fn read_u64(&self) -> Result<u64> {
        if self.uses_network_byte_order() {
            if self.uses_split_u64() {
                let lo = self.read_u32()?;
                let hi = self.read_u32()?;
                Ok(join_ne_halves(lo, hi))
            } else {
                let mut buf = [0u8; 8];
                self.read_exact(&mut buf)?;
                Ok(u64::from_be_bytes(buf))
            }
        } else {
            let mut buf = [0u8; 8];
            self.read_exact(&mut buf)?;
            Ok(u64::from_ne_bytes(buf))
        }
    }

    /// Write a 64-bit unsigned integer. See [`Transport::read_u64`] for the
    /// wire layout.
    fn write_u64(&self, x: u64) -> Result<()> {
        if self.uses_network_byte_order() {
            if self.uses_split_u64() {
                let (lo, hi) = split_ne_halves(x);
                self.write_u32(lo)?;
                self.write_u32(hi)
            } else {
                self.write_all(&x.to_be_bytes())
            }
        } else {
            self.write_all(&x.to_ne_bytes())
        }
    }

    /// Read a null-terminated string of at most `max_len` bytes.
    ///
    /// Fails with [`NetError::StringTooLong`] when `max_len` is reached
    /// before the terminator.
    fn read_cstring(&self, max_len: usize) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let b = self.read_u8()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
            if bytes.len() > max_len {
                return Err(NetError::StringTooLong { limit: max_len });
            }
        }
        String::from_utf8(bytes)
            .map_err(|_| NetError::Protocol("invalid UTF-8 in string".into()))
    }

    /// Write a string followed by a null terminator.
    fn write_cstring(&self, s: &str) -> Result<()> {
        self.write_all(s.as_bytes())?;
        self.write_all(&[0])
    }

    /// Wait up to `timeout` for data to arrive. Returns whether a read would
    /// now make progress.
    fn readable(&self, timeout: Duration) -> Result<bool>;

    /// Block until either the socket is readable or `event` is signalled.
    /// Returns true if the socket was readable, false if the event fired.
    #[cfg(target_os = "linux")]
    fn readable_or_event(&self, event: &EventFd) -> Result<bool> {
        let _ = event;
        Err(NetError::Unsupported("readable_or_event on this transport"))
    }

    /// Request a half-close of the send direction.
    fn start_graceful_shutdown(&self) {}

    /// Drain and discard incoming bytes until the peer closes.
    fn wait_for_graceful_disconnect(&self) -> Result<()> {
        let mut buf = [0u8; 1024];
        loop {
            if self.read_some(&mut buf)? == 0 {
                return Ok(());
            }
        }
    }

    /// Invalidate the handle immediately, from any thread.
    ///
    /// Asynchronous and idempotent. A reader or writer blocked on the same
    /// socket terminates with [`NetError::NotASocket`] or
    /// [`NetError::ConnectionReset`] within bounded time.
    fn ungraceful_shutdown(&self);

    /// Enable TCP keep-alive probes at the given idle period. Best effort.
    fn enable_tcp_keepalive(&self, period: Duration) -> Result<()> {
        let _ = period;
        Ok(())
    }

    /// Toggle Nagle's algorithm. Best effort.
    fn set_no_delay(&self, enabled: bool) -> Result<()> {
        let _ = enabled;
        Ok(())
    }

    /// Toggle `SO_REUSEADDR`. Best effort.
    fn set_address_reuse(&self, enabled: bool) -> Result<()> {
        let _ = enabled;
        Ok(())
    }

    /// The remote endpoint, when connected.
    fn peer_endpoint(&self) -> Option<IpEndpoint> {
        None
    }
}

/// Split a u64 into two u32 halves in host memory order (the order a memcpy
/// of the value would produce).
pub(crate) fn split_ne_halves(x: u64) -> (u32, u32) {
    let b = x.to_ne_bytes();
    (
        u32::from_ne_bytes([b[0], b[1], b[2], b[3]]),
        u32::from_ne_bytes([b[4], b[5], b[6], b[7]]),
    )
}

/// Inverse of [`split_ne_halves`].
pub(crate) fn join_ne_halves(lo: u32, hi: u32) -> u64 {
    let lo = lo.to_ne_bytes();
    let hi = hi.to_ne_bytes();
    u64::from_ne_bytes([lo[0], lo[1], lo[2], lo[3], hi[0], hi[1], hi[2], hi[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_join_round_trip() {
        for x in [0u64, 1, 0xdead_beef, u64::MAX, 0x0123_4567_89ab_cdef] {
            let (lo, hi) = split_ne_halves(x);
            assert_eq!(join_ne_halves(lo, hi), x);
        }
    }
}
