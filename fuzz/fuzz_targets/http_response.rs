//! Drive the HTTP client over arbitrary response bytes.
//!
//! `!` in the input starts a new delivery buffer and `|` ends the input, so
//! the fuzzer also chooses the read partitioning. Every outcome must be a
//! response or an enumerated error, with allocation bounded by the
//! configured caps.

#![no_main]

use std::sync::Arc;

use lattice_net::{HttpClient, SharedTransport, TestSocket};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let socket = Arc::new(TestSocket::from_delimited(data));
    let mut client = HttpClient::new();
    client.config.max_data_size = 1 << 20;
    client.config.max_socket_buffer_size = 1 << 16;
    client.test_socket = Some(socket as SharedTransport);
    let _ = client.get("http://fuzz.local/input");
});
