//! Drive the framed packet reader over arbitrary bytes.

#![no_main]

use std::sync::Arc;

use lattice_net::{PacketStream, SharedTransport, TestSocket};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let socket = Arc::new(TestSocket::from_delimited(data));
    let stream = PacketStream::new(socket as SharedTransport);
    // Read frames until the stream errors or drains.
    while stream.read_packet().is_ok() {}
});
