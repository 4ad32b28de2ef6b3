//! Streaming sink interface for HTTP response bodies.

use crate::error::{NetError, Result};

use super::ResponseInfo;

// Bound on the up-front reservation for a declared content length; growth
// beyond it happens as data actually arrives.
const MAX_BODY_PREALLOC: u64 = 1 << 20;

/// Receives a response body as it is decoded.
///
/// [`DataSink::have_content_length`] is called once, before any data, and
/// only when the server supplied a length; then zero or more
/// [`DataSink::handle_data`] calls deliver successive body slices.
pub trait DataSink {
    /// Upper bound on the body size, when the server supplied one.
    fn have_content_length(&mut self, content_length: u64) -> Result<()> {
        let _ = content_length;
        Ok(())
    }

    /// One decoded body slice.
    fn handle_data(&mut self, data: &[u8], response_info: &ResponseInfo) -> Result<()>;
}

/// Aggregates the body into a byte vector, enforcing a total-size cap.
pub struct BufferSink {
    data: Vec<u8>,
    max_data_size: u64,
}

impl BufferSink {
    /// A sink that rejects bodies larger than `max_data_size` bytes.
    pub fn new(max_data_size: u64) -> Self {
        Self {
            data: Vec::new(),
            max_data_size,
        }
    }

    /// The bytes received so far.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the sink, returning the aggregated body.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl DataSink for BufferSink {
    fn have_content_length(&mut self, content_length: u64) -> Result<()> {
        if content_length > self.max_data_size {
            return Err(NetError::SizeLimitExceeded {
                size: content_length,
                limit: self.max_data_size,
            });
        }
        self.data
            .reserve(content_length.min(MAX_BODY_PREALLOC) as usize);
        Ok(())
    }

    fn handle_data(&mut self, data: &[u8], _response_info: &ResponseInfo) -> Result<()> {
        let new_len = (self.data.len() as u64)
            .checked_add(data.len() as u64)
            .ok_or_else(|| NetError::Protocol("body length overflow".into()))?;
        if new_len > self.max_data_size {
            return Err(NetError::SizeLimitExceeded {
                size: new_len,
                limit: self.max_data_size,
            });
        }
        self.data.extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation() {
        let info = ResponseInfo::default();
        let mut sink = BufferSink::new(1024);
        sink.have_content_length(11).unwrap();
        sink.handle_data(b"hello ", &info).unwrap();
        sink.handle_data(b"world", &info).unwrap();
        assert_eq!(sink.into_inner(), b"hello world");
    }

    #[test]
    fn test_content_length_over_cap_rejected_up_front() {
        let mut sink = BufferSink::new(4);
        let err = sink.have_content_length(100).unwrap_err();
        assert!(matches!(
            err,
            NetError::SizeLimitExceeded { size: 100, limit: 4 }
        ));
        assert!(sink.data().is_empty());
    }

    #[test]
    fn test_cumulative_cap_enforced() {
        let info = ResponseInfo::default();
        let mut sink = BufferSink::new(8);
        sink.handle_data(b"12345", &info).unwrap();
        let err = sink.handle_data(b"6789", &info).unwrap_err();
        assert!(matches!(err, NetError::SizeLimitExceeded { .. }));
    }

    #[test]
    fn test_huge_declared_length_does_not_preallocate() {
        // A hostile content length within the cap must not drive a huge
        // reservation.
        let mut sink = BufferSink::new(u64::MAX);
        sink.have_content_length(u64::MAX - 1).unwrap();
        assert!(sink.data.capacity() as u64 <= 2 * MAX_BODY_PREALLOC);
    }
}
