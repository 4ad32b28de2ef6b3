//! In-memory transport backed by a queue of byte buffers.
//!
//! Reads serve from the front buffer and advance a cursor, popping buffers as
//! they drain; a drained queue reads as a graceful close. Writes append to a
//! separate capture vector for test assertions. Used by the unit tests, the
//! partitioning property tests and the fuzz harness.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
#[cfg(target_os = "linux")]
use crate::event_fd::EventFd;
use crate::transport::Transport;

#[derive(Default)]
struct State {
    buffers: VecDeque<Vec<u8>>,
    read_index: usize,
    written: Vec<Vec<u8>>,
}

/// An in-memory [`Transport`].
pub struct TestSocket {
    state: Mutex<State>,
    network_byte_order: AtomicBool,
}

impl TestSocket {
    /// An empty socket; reads see an immediate graceful close.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            network_byte_order: AtomicBool::new(true),
        }
    }

    /// A socket whose reads serve the given buffers in order.
    pub fn from_buffers<I>(buffers: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let socket = Self::new();
        {
            let mut state = socket.state.lock();
            state.buffers = buffers.into_iter().collect();
        }
        socket
    }

    /// Build the buffer queue from delimited input: `!` starts a new buffer
    /// and `|` ends the input (anything after it is discarded). This is the
    /// format the fuzz harness feeds in, so arbitrary bytes choose their own
    /// read partitioning.
    pub fn from_delimited(input: &[u8]) -> Self {
        let mut buffers = VecDeque::new();
        let mut current = Vec::new();
        for &byte in input {
            match byte {
                b'!' => buffers.push_back(std::mem::take(&mut current)),
                b'|' => break,
                _ => current.push(byte),
            }
        }
        if !current.is_empty() {
            buffers.push_back(current);
        }
        let socket = Self::new();
        socket.state.lock().buffers = buffers;
        socket
    }

    /// Append a buffer to the read queue.
    pub fn push_buffer(&self, data: Vec<u8>) {
        self.state.lock().buffers.push_back(data);
    }

    /// The capture vector of writes, one entry per `write_all`.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    /// All written bytes, concatenated.
    pub fn written_concat(&self) -> Vec<u8> {
        self.state.lock().written.iter().flatten().copied().collect()
    }

    /// Select the byte-order policy for the typed integer I/O.
    pub fn set_network_byte_order(&self, enabled: bool) {
        self.network_byte_order.store(enabled, Ordering::Relaxed);
    }
}

impl Transport for TestSocket {
    fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        loop {
            let available = match state.buffers.front() {
                None => return Ok(0),
                Some(front) => front.len() - state.read_index,
            };
            if available == 0 {
                state.buffers.pop_front();
                state.read_index = 0;
                continue;
            }
            let n = available.min(buf.len());
            if let Some(front) = state.buffers.front() {
                buf[..n].copy_from_slice(&front[state.read_index..state.read_index + n]);
            }
            state.read_index += n;
            return Ok(n);
        }
    }

    fn write_all(&self, buf: &[u8]) -> Result<()> {
        self.state.lock().written.push(buf.to_vec());
        Ok(())
    }

    fn uses_network_byte_order(&self) -> bool {
        self.network_byte_order.load(Ordering::Relaxed)
    }

    fn readable(&self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    #[cfg(target_os = "linux")]
    fn readable_or_event(&self, _event: &EventFd) -> Result<bool> {
        Ok(true)
    }

    fn ungraceful_shutdown(&self) {}
}
