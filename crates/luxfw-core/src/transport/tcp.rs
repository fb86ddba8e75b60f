//! TCP transport to the datalogger.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::traits::{DeviceTransport, TransportError};
use crate::protocol::Response;
use crate::protocol::constants::{IO_TIMEOUT_MS, RESPONSE_BUFFER_LEN};

/// Blocking TCP transport with bounded connect/read/write timeouts.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_millis(IO_TIMEOUT_MS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            stream: None,
            timeout,
        }
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

/// One bounded read. EINTR is retried; timeouts become `Timeout`.
fn read_once<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    timeout_ms: u64,
) -> Result<usize, TransportError> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                        TransportError::Timeout { timeout_ms }
                    }
                    _ => TransportError::ReadFailed(e.to_string()),
                });
            }
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTransport for TcpTransport {
    #[instrument(level = "info", skip(self))]
    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        self.close();

        let addrs: Vec<_> = (host, port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve {
                host: host.to_string(),
                port,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::Resolve {
                host: host.to_string(),
                port,
            });
        }

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    stream.set_nodelay(true)?;
                    info!(%addr, "Connected");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    debug!(%addr, error = %e, "Connect attempt failed");
                    last_error = Some(TransportError::ConnectFailed {
                        addr: addr.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Err(last_error.unwrap_or(TransportError::NotConnected))
    }

    #[instrument(skip(self, frame), fields(len = frame.len()))]
    fn send(&mut self, frame: &[u8]) -> Result<Response, TransportError> {
        let timeout_ms = self.timeout_ms();
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        stream
            .write_all(frame)
            .and_then(|_| stream.flush())
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut buf = [0u8; RESPONSE_BUFFER_LEN];
        let n = read_once(stream, &mut buf, timeout_ms)?;

        let response = Response::from_bytes(&buf[..n]);
        debug!(bytes_read = n, response = %response, "Read complete");
        Ok(response)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                warn!(error = %e, "Socket shutdown failed");
            }
            debug!("Connection closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
