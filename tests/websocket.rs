//! WebSocket transport against a real in-process server.

mod common;

use std::net::TcpListener;
use std::thread::JoinHandle;
use std::time::Duration;

use lattice_net::{NetError, ReadyState, Transport, WebSocketTransport};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::Message;

use common::init_networking;

// Accept one WebSocket connection and run `serve` over it.
fn spawn_ws_server<F, T>(serve: F) -> (u16, JoinHandle<T>)
where
    F: FnOnce(&mut tungstenite::WebSocket<std::net::TcpStream>) -> T + Send + 'static,
    T: Send + 'static,
{
    init_networking();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut ws = tungstenite::accept(stream).unwrap();
        serve(&mut ws)
    });
    (port, handle)
}

#[test]
fn read_exact_reassembles_frames() {
    let (port, server) = spawn_ws_server(|ws| {
        ws.send(Message::Binary(b"hel".to_vec())).unwrap();
        ws.send(Message::Binary(b"lo ".to_vec())).unwrap();
        ws.send(Message::Binary(b"world".to_vec())).unwrap();
        // Keep the connection open until the client has read everything.
        match ws.read() {
            Ok(Message::Close(_)) | Err(_) => {}
            other => panic!("expected close, got {:?}", other),
        }
    });

    let socket = WebSocketTransport::connect("ws", "127.0.0.1", port).unwrap();
    assert_eq!(socket.ready_state(), ReadyState::Open);

    let mut buf = [0u8; 11];
    socket.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello world");

    socket.start_graceful_shutdown();
    assert_eq!(socket.ready_state(), ReadyState::Closing);
    server.join().unwrap();
}

#[test]
fn read_some_is_unsupported() {
    let (port, server) = spawn_ws_server(|ws| {
        let _ = ws.read();
    });
    let socket = WebSocketTransport::connect("ws", "127.0.0.1", port).unwrap();
    let mut buf = [0u8; 4];
    let err = socket.read_some(&mut buf).unwrap_err();
    assert!(matches!(err, NetError::Unsupported(_)), "got {:?}", err);
    drop(socket);
    server.join().unwrap();
}

#[test]
fn writes_arrive_as_binary_frames() {
    let (port, server) = spawn_ws_server(|ws| {
        let mut payloads = Vec::new();
        loop {
            match ws.read() {
                Ok(Message::Binary(data)) => payloads.push(data),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        payloads
    });

    let socket = WebSocketTransport::connect("ws", "127.0.0.1", port).unwrap();
    socket.write_all(b"first").unwrap();
    socket.write_u32(0x0102_0304).unwrap();
    socket.start_graceful_shutdown();

    let payloads = server.join().unwrap();
    assert_eq!(payloads, vec![b"first".to_vec(), vec![1, 2, 3, 4]]);
}

#[test]
fn graceful_shutdown_sends_normal_closure() {
    let (port, server) = spawn_ws_server(|ws| loop {
        match ws.read() {
            Ok(Message::Close(frame)) => return frame,
            Ok(_) => {}
            Err(_) => return None,
        }
    });

    let socket = WebSocketTransport::connect("ws", "127.0.0.1", port).unwrap();
    socket.start_graceful_shutdown();

    let frame = server.join().unwrap().expect("close frame");
    assert_eq!(frame.code, CloseCode::Normal);
}

#[test]
fn peer_close_fails_pending_read() {
    let (port, server) = spawn_ws_server(|ws| {
        ws.send(Message::Binary(b"xy".to_vec())).unwrap();
        ws.close(None).unwrap();
        // Drain until the close handshake completes.
        while ws.read().is_ok() {}
    });

    let socket = WebSocketTransport::connect("ws", "127.0.0.1", port).unwrap();
    // More than was ever sent: the close must unblock the read.
    let mut buf = [0u8; 16];
    let err = socket.read_exact(&mut buf).unwrap_err();
    assert!(matches!(err, NetError::ConnectionClosed), "got {:?}", err);
    // Dropping the transport tears the stream down, unblocking the server's
    // drain loop.
    drop(socket);
    server.join().unwrap();
}

#[test]
fn readable_reflects_buffered_frames() {
    let (port, server) = spawn_ws_server(|ws| {
        ws.send(Message::Binary(b"ping".to_vec())).unwrap();
        let _ = ws.read();
    });

    let socket = WebSocketTransport::connect("ws", "127.0.0.1", port).unwrap();
    assert!(socket.readable(Duration::from_secs(2)).unwrap());
    let mut buf = [0u8; 4];
    socket.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    socket.start_graceful_shutdown();
    server.join().unwrap();
}

#[test]
fn invalid_scheme_rejected() {
    let err = WebSocketTransport::connect("http", "127.0.0.1", 80).unwrap_err();
    assert!(matches!(err, NetError::InvalidScheme(_)), "got {:?}", err);
}
