//! Device transport abstraction.
//!
//! Defines the `DeviceTransport` trait for talking to a datalogger,
//! allowing different implementations (TCP, mock, etc.).

use crate::protocol::Response;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    #[error("Connect to {addr} failed: {message}")]
    ConnectFailed { addr: String, message: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors the SendData loop may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Abstract request/response link to one device.
///
/// One command is outstanding at a time: `send` writes a complete frame and
/// performs a single bounded read.
pub trait DeviceTransport {
    /// Open the connection.
    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError>;

    /// Send one frame and read one response.
    ///
    /// A zero-byte read yields an empty [`Response`], not an error.
    fn send(&mut self, frame: &[u8]) -> Result<Response, TransportError>;

    /// Release the connection. Safe to call more than once.
    fn close(&mut self);

    fn is_connected(&self) -> bool;
}
