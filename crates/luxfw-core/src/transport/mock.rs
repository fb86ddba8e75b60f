//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{DeviceTransport, TransportError};
use crate::protocol::Response;
use crate::protocol::constants::IO_TIMEOUT_MS;

/// Scripted reply for the next `send`.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Device answered with these bytes.
    Bytes(Vec<u8>),
    /// Zero-byte read.
    Empty,
    /// Read timed out.
    Timeout,
    /// Write failed (connection reset, etc.).
    WriteError,
}

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<MockReply>,
    writes: Vec<Vec<u8>>,
    connected: bool,
    refuse_connect: bool,
    connect_count: usize,
    close_count: usize,
    endpoint: Option<(String, u16)>,
}

/// Mock transport for unit testing the update state machine.
///
/// Clones share state, so a test can keep a handle while the updater owns
/// another one.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Queue a reply for the next send.
    pub fn queue(&self, reply: MockReply) {
        self.state().replies.push_back(reply);
    }

    /// Queue a response carrying `bytes`.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.queue(MockReply::Bytes(bytes.to_vec()));
    }

    /// Queue `n` zero-byte reads.
    pub fn queue_empty(&self, n: usize) {
        for _ in 0..n {
            self.queue(MockReply::Empty);
        }
    }

    /// Make the next `connect` fail.
    pub fn refuse_connect(&self) {
        self.state().refuse_connect = true;
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    /// Replies not yet consumed.
    pub fn pending_replies(&self) -> usize {
        self.state().replies.len()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connect_count
    }

    /// Number of times an open connection was released.
    pub fn close_count(&self) -> usize {
        self.state().close_count
    }

    /// Last endpoint passed to `connect`.
    pub fn endpoint(&self) -> Option<(String, u16)> {
        self.state().endpoint.clone()
    }
}

impl DeviceTransport for MockTransport {
    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        let mut state = self.state();
        state.endpoint = Some((host.to_string(), port));
        if state.refuse_connect {
            return Err(TransportError::ConnectFailed {
                addr: format!("{host}:{port}"),
                message: "connection refused".into(),
            });
        }
        state.connected = true;
        state.connect_count += 1;
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<Response, TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.writes.push(frame.to_vec());
        match state.replies.pop_front() {
            Some(MockReply::Bytes(bytes)) => Ok(Response::from_bytes(&bytes)),
            Some(MockReply::Empty) => Ok(Response::empty()),
            Some(MockReply::WriteError) => {
                Err(TransportError::WriteFailed("connection reset by peer".into()))
            }
            Some(MockReply::Timeout) | None => Err(TransportError::Timeout {
                timeout_ms: IO_TIMEOUT_MS,
            }),
        }
    }

    fn close(&mut self) {
        let mut state = self.state();
        if state.connected {
            state.connected = false;
            state.close_count += 1;
        }
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}
