//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread::JoinHandle;

use lattice_net::{Networking, TcpSocket, Transport};

/// Initialise the networking subsystem, tolerating earlier initialisation by
/// another test.
pub fn init_networking() {
    let _ = Networking::init();
}

/// A canned-response TCP server for driving the client side of a transport.
///
/// Each accepted connection is served one response from the script, in order;
/// the request bytes are read (up to one buffer) and discarded.
pub struct ScriptedServer {
    pub port: u16,
    handle: Option<JoinHandle<usize>>,
}

impl ScriptedServer {
    /// Serve `responses.len()` connections, one response each, then exit.
    pub fn start(responses: Vec<Vec<u8>>) -> Self {
        init_networking();
        let listener = TcpSocket::bind_and_listen(0, true).expect("bind scripted server");
        let port = listener.local_endpoint().expect("local endpoint").port;

        let handle = std::thread::spawn(move || {
            let mut served = 0;
            for response in responses {
                let conn = match listener.accept_connection() {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let mut request = [0u8; 4096];
                let _ = conn.read_some(&mut request);
                if conn.write_all(&response).is_err() {
                    break;
                }
                // Half-close and drop; waiting for the client's close here
                // would deadlock tests that keep their client alive.
                conn.start_graceful_shutdown();
                served += 1;
            }
            served
        });

        Self {
            port,
            handle: Some(handle),
        }
    }

    /// Wait for the server to finish and return how many connections it
    /// served.
    pub fn join(mut self) -> usize {
        self.handle
            .take()
            .map(|handle| handle.join().expect("scripted server panicked"))
            .unwrap_or(0)
    }
}

/// Spawn an echo peer: accepts one connection and echoes everything back.
pub fn spawn_echo_server() -> (u16, JoinHandle<()>) {
    init_networking();
    let listener = TcpSocket::bind_and_listen(0, true).expect("bind echo server");
    let port = listener.local_endpoint().expect("local endpoint").port;
    let handle = std::thread::spawn(move || {
        let conn = match listener.accept_connection() {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let conn = Arc::new(conn);
        let mut buf = [0u8; 4096];
        loop {
            match conn.read_some(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if conn.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });
    (port, handle)
}
