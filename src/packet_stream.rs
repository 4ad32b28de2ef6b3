//! Length-prefixed packet framing over any transport.
//!
//! Frame layout: a 32-bit big-endian byte count, then that many payload
//! bytes. Declared lengths of zero or above [`MAX_PACKET_SIZE`] are rejected
//! before any allocation.

use bytes::{BufMut, BytesMut};

use crate::error::{NetError, Result};
use crate::packet::{Packet, MAX_PACKET_SIZE};
use crate::transport::SharedTransport;

/// A framed record layer above a [`SharedTransport`].
pub struct PacketStream {
    transport: SharedTransport,
}

impl PacketStream {
    /// Frame packets over `transport`.
    pub fn new(transport: SharedTransport) -> Self {
        Self { transport }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Read one framed packet. Blocks until the full frame has arrived.
    pub fn read_packet(&self) -> Result<Packet> {
        let mut len_buf = [0u8; 4];
        self.transport.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(NetError::Protocol("zero-length packet frame".into()));
        }
        if len > MAX_PACKET_SIZE {
            return Err(NetError::Protocol(format!(
                "packet frame of {} B exceeds the {} B limit",
                len, MAX_PACKET_SIZE
            )));
        }
        let mut payload = vec![0u8; len];
        self.transport.read_exact(&mut payload)?;
        Ok(Packet::from_payload(payload))
    }

    /// Write one framed packet; the length prefix and payload go out in a
    /// single flush.
    pub fn write_packet(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(NetError::Protocol("zero-length packet frame".into()));
        }
        if payload.len() > MAX_PACKET_SIZE {
            return Err(NetError::Protocol(format!(
                "packet frame of {} B exceeds the {} B limit",
                payload.len(),
                MAX_PACKET_SIZE
            )));
        }
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(payload);
        self.transport.write_all(&frame)
    }
}
