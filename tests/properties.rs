//! Property suites: delivery-partitioning invariance, chunked reassembly and
//! typed integer round-trips.

use std::sync::Arc;

use lattice_net::{HttpClient, SharedTransport, TestSocket, Transport};
use proptest::prelude::*;

// Split `bytes` into consecutive buffers at the given fractional cut points.
fn partition(bytes: &[u8], cuts: &[prop::sample::Index]) -> Vec<Vec<u8>> {
    let mut positions: Vec<usize> = cuts.iter().map(|cut| cut.index(bytes.len() + 1)).collect();
    positions.sort_unstable();
    let mut buffers = Vec::with_capacity(positions.len() + 1);
    let mut start = 0;
    for &pos in &positions {
        buffers.push(bytes[start..pos].to_vec());
        start = pos;
    }
    buffers.push(bytes[start..].to_vec());
    buffers
}

fn download_body(buffers: Vec<Vec<u8>>) -> Result<Vec<u8>, lattice_net::NetError> {
    let socket = Arc::new(TestSocket::from_buffers(buffers));
    let mut client = HttpClient::new();
    client.test_socket = Some(socket as SharedTransport);
    client.get("http://example.org/x").map(|(_, body)| body)
}

fn encode_chunked(chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut response =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    for chunk in chunks.iter().filter(|chunk| !chunk.is_empty()) {
        response.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        response.extend_from_slice(chunk);
        response.extend_from_slice(b"\r\n");
    }
    response.extend_from_slice(b"0\r\n\r\n");
    response
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // The decoded body does not depend on how the byte stream is cut into
    // delivery buffers.
    #[test]
    fn prop_partitioning_invariance(
        body in prop::collection::vec(any::<u8>(), 0..512),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
    ) {
        let mut response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len())
            .into_bytes();
        response.extend_from_slice(&body);

        let whole = download_body(vec![response.clone()]).unwrap();
        let split = download_body(partition(&response, &cuts)).unwrap();

        prop_assert_eq!(&whole, &body);
        prop_assert_eq!(whole, split);
    }

    // For any chunk sizes, the delivered body is the in-order concatenation
    // of the chunk payloads.
    #[test]
    fn prop_chunked_reassembly(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 0..10),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let expected: Vec<u8> = chunks.iter().flatten().copied().collect();
        let response = encode_chunked(&chunks);

        let whole = download_body(vec![response.clone()]).unwrap();
        prop_assert_eq!(&whole, &expected);

        let split = download_body(partition(&response, &cuts)).unwrap();
        prop_assert_eq!(whole, split);
    }

    // Adversarial header bytes either produce a response or an enumerated
    // error; the scratch buffer cap bounds all growth.
    #[test]
    fn prop_download_is_total(
        input in prop::collection::vec(any::<u8>(), 0..2048),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let socket = Arc::new(TestSocket::from_buffers(partition(&input, &cuts)));
        let mut client = HttpClient::new();
        client.config.max_data_size = 1 << 16;
        client.config.max_socket_buffer_size = 4096;
        client.test_socket = Some(socket as SharedTransport);
        // Any outcome but a panic or runaway allocation is acceptable.
        let _ = client.get("http://example.org/fuzzed");
    }

    // Typed integer round-trips through a transport under both byte-order
    // policies.
    #[test]
    fn prop_i32_round_trip(value in any::<i32>(), network_order in any::<bool>()) {
        let writer = TestSocket::new();
        writer.set_network_byte_order(network_order);
        writer.write_i32(value).unwrap();

        let reader = TestSocket::from_buffers(vec![writer.written_concat()]);
        reader.set_network_byte_order(network_order);
        prop_assert_eq!(reader.read_i32().unwrap(), value);
    }

    // The split-halves u64 layout survives a round trip regardless of the
    // host's endianness.
    #[test]
    fn prop_u64_round_trip(value in any::<u64>()) {
        let writer = TestSocket::new();
        writer.write_u64(value).unwrap();
        let reader = TestSocket::from_buffers(vec![writer.written_concat()]);
        prop_assert_eq!(reader.read_u64().unwrap(), value);
    }
}
