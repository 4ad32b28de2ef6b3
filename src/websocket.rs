//! WebSocket transport for hosts that expose a WebSocket API rather than raw
//! sockets.
//!
//! A receiver thread plays the role of the host's on-message callback: each
//! incoming binary frame is appended to a FIFO receive buffer under a mutex
//! and a condition variable is signalled. `read_exact` sleeps on that
//! condition variable until enough bytes have arrived or the socket is
//! closing. Writes are synchronous sends on the underlying stream.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::error::{NetError, Result};
use crate::transport::Transport;

// Bounds how long the receiver thread holds the stream lock per poll, which
// in turn bounds how long a writer can be starved.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

type WsStream = WebSocket<MaybeTlsStream<TcpStream>>;

/// The four-valued WebSocket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Handshake in progress.
    Connecting,
    /// Open for reads and writes.
    Open,
    /// A close has been initiated locally.
    Closing,
    /// The connection is down.
    Closed,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

// FIFO byte queue mutated only under the mutex; the condition variable
// signals arrival of bytes or closure. Once `closing` is set, readers fail
// with ConnectionClosed instead of blocking.
struct QueueState {
    data: VecDeque<u8>,
    closing: bool,
}

struct ReceiveQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl ReceiveQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                data: VecDeque::new(),
                closing: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn push(&self, bytes: &[u8]) {
        {
            let mut state = self.state.lock();
            state.data.extend(bytes.iter().copied());
        }
        self.cond.notify_all();
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closing = true;
        }
        self.cond.notify_all();
    }

    fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    fn read_exact_into(&self, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        while state.data.len() < buf.len() && !state.closing {
            self.cond.wait(&mut state);
        }
        if state.closing {
            return Err(NetError::ConnectionClosed);
        }
        let wanted = buf.len();
        for (slot, byte) in buf.iter_mut().zip(state.data.drain(..wanted)) {
            *slot = byte;
        }
        Ok(())
    }

    fn wait_readable(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.closing {
            return false;
        }
        if state.data.is_empty() {
            let _ = self.cond.wait_for(&mut state, timeout);
        }
        !state.data.is_empty() && !state.closing
    }
}

struct Shared {
    stream: Mutex<WsStream>,
    queue: ReceiveQueue,
    state: AtomicU8,
}

impl Shared {
    fn set_state(&self, state: ReadyState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

fn tcp_stream_of(ws: &WsStream) -> Option<&TcpStream> {
    match ws.get_ref() {
        MaybeTlsStream::Plain(stream) => Some(stream),
        MaybeTlsStream::Rustls(tls) => Some(&tls.sock),
        _ => None,
    }
}

fn map_ws_error(e: tungstenite::Error) -> NetError {
    match e {
        tungstenite::Error::Io(e) => NetError::from_io(e),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            NetError::ConnectionClosed
        }
        other => NetError::Protocol(format!("WebSocket error: {}", other)),
    }
}

fn receive_loop(shared: Arc<Shared>) {
    loop {
        if shared.queue.is_closing() {
            break;
        }
        let message = {
            let mut ws = shared.stream.lock();
            ws.read()
        };
        match message {
            Ok(Message::Binary(payload)) => shared.queue.push(&payload),
            Ok(Message::Text(text)) => {
                // The binary subprotocol was negotiated; a peer sending text
                // frames is misbehaving.
                warn!(len = text.len(), "ignoring unexpected text frame");
            }
            Ok(Message::Close(frame)) => {
                debug!(?frame, "peer closed WebSocket");
                shared.set_state(ReadyState::Closed);
                shared.queue.close();
                break;
            }
            // Ping/pong is handled inside the protocol layer.
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                if !shared.queue.is_closing() {
                    debug!(error = %e, "WebSocket receive failed");
                }
                shared.set_state(ReadyState::Closed);
                shared.queue.close();
                break;
            }
        }
    }
}

/// A [`Transport`] over a WebSocket connection.
///
/// `read_some` is not supported on this transport; the byte stream is only
/// exposed through `read_exact` and the typed readers.
pub struct WebSocketTransport {
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport").finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Connect a binary-subprotocol WebSocket to `scheme://host:port`.
    ///
    /// `scheme` must be `ws` or `wss`. Fails with
    /// [`NetError::ConnectionFailed`] when the socket closes during the
    /// handshake.
    pub fn connect(scheme: &str, host: &str, port: u16) -> Result<Self> {
        if scheme != "ws" && scheme != "wss" {
            return Err(NetError::InvalidScheme(scheme.to_string()));
        }
        let url = format!("{}://{}:{}", scheme, host, port);
        let mut request = url.clone().into_client_request().map_err(|e| {
            NetError::ConnectionFailed {
                detail: format!("invalid WebSocket request for '{}': {}", url, e),
            }
        })?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("binary"));

        debug!(%url, "connecting WebSocket");
        let (ws, _response) =
            tungstenite::connect(request).map_err(|e| NetError::ConnectionFailed {
                detail: format!("WebSocket connect to '{}' failed: {}", url, e),
            })?;

        if let Some(stream) = tcp_stream_of(&ws) {
            if let Err(e) = stream.set_read_timeout(Some(READ_POLL_INTERVAL)) {
                warn!(error = %e, "failed to set receive poll interval");
            }
        }

        let shared = Arc::new(Shared {
            stream: Mutex::new(ws),
            queue: ReceiveQueue::new(),
            state: AtomicU8::new(ReadyState::Open as u8),
        });
        let receiver = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("ws-recv".into())
                .spawn(move || receive_loop(shared))
                .map_err(NetError::from_io)?
        };
        Ok(Self {
            shared,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// The current lifecycle state.
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.shared.state.load(Ordering::Relaxed))
    }
}

impl Transport for WebSocketTransport {
    /// Not supported; use [`Transport::read_exact`] or the typed readers.
    fn read_some(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(NetError::Unsupported("read_some on the WebSocket transport"))
    }

    fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        self.shared.queue.read_exact_into(buf)
    }

    fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut ws = self.shared.stream.lock();
        ws.send(Message::Binary(buf.to_vec())).map_err(map_ws_error)
    }

    fn readable(&self, timeout: Duration) -> Result<bool> {
        Ok(self.shared.queue.wait_readable(timeout))
    }

    fn start_graceful_shutdown(&self) {
        self.shared.set_state(ReadyState::Closing);
        {
            let mut ws = self.shared.stream.lock();
            // Close code 1000 (normal closure). 1001 means the endpoint is
            // going away and browser-style hosts reject it from clients.
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed(""),
            };
            if let Err(e) = ws.close(Some(frame)) {
                debug!(error = %e, "WebSocket close failed");
            }
            let _ = ws.flush();
        }
        self.shared.queue.close();
    }

    fn wait_for_graceful_disconnect(&self) -> Result<()> {
        Ok(())
    }

    fn ungraceful_shutdown(&self) {
        self.shared.set_state(ReadyState::Closed);
        self.shared.queue.close();
        let ws = self.shared.stream.lock();
        if let Some(stream) = tcp_stream_of(&ws) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.ungraceful_shutdown();
        if let Some(handle) = self.receiver.lock().take() {
            if handle.join().is_err() {
                warn!("WebSocket receiver thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_queue_read_after_push() {
        let queue = ReceiveQueue::new();
        queue.push(b"hello");
        let mut buf = [0u8; 5];
        queue.read_exact_into(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_queue_close_fails_blocked_reader() {
        let queue = Arc::new(ReceiveQueue::new());
        let reader_queue = Arc::clone(&queue);
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 16];
            reader_queue.read_exact_into(&mut buf)
        });
        thread::sleep(Duration::from_millis(20));
        queue.close();
        let result = reader.join().unwrap();
        assert!(matches!(result, Err(NetError::ConnectionClosed)));
    }

    #[test]
    fn test_queue_closing_beats_buffered_data() {
        // Once closing is set, reads fail even if enough bytes are queued.
        let queue = ReceiveQueue::new();
        queue.push(b"data");
        queue.close();
        let mut buf = [0u8; 4];
        assert!(matches!(
            queue.read_exact_into(&mut buf),
            Err(NetError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_queue_wait_readable() {
        let queue = ReceiveQueue::new();
        assert!(!queue.wait_readable(Duration::from_millis(10)));
        queue.push(b"x");
        assert!(queue.wait_readable(Duration::from_millis(10)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // For any interleaving of appends summing to M bytes, a single
        // read of M bytes returns the concatenation.
        #[test]
        fn prop_interleaved_appends_read_in_order(
            chunks in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..64),
                1..16,
            )
        ) {
            let queue = Arc::new(ReceiveQueue::new());
            let total: usize = chunks.iter().map(|c| c.len()).sum();
            let expected: Vec<u8> = chunks.iter().flatten().copied().collect();

            let writer_queue = Arc::clone(&queue);
            let writer = thread::spawn(move || {
                for chunk in &chunks {
                    writer_queue.push(chunk);
                    thread::yield_now();
                }
            });

            let mut buf = vec![0u8; total];
            queue.read_exact_into(&mut buf).unwrap();
            writer.join().unwrap();

            prop_assert_eq!(buf, expected);
        }
    }
}
