//! Transport wrapper that reports traffic to an observer.

use super::traits::{DeviceTransport, TransportError};
use crate::events::{PacketDirection, UpdateEvent, UpdateObserver};
use crate::protocol::Response;

/// TX frames are reported up to this many bytes.
const TX_PREVIEW_LEN: usize = 32;

/// Transport wrapper that emits packet events.
pub struct ObservableTransport<'a, T: DeviceTransport, O: UpdateObserver + ?Sized> {
    inner: &'a mut T,
    observer: &'a O,
}

impl<'a, T: DeviceTransport, O: UpdateObserver + ?Sized> ObservableTransport<'a, T, O> {
    pub fn new(inner: &'a mut T, observer: &'a O) -> Self {
        Self { inner, observer }
    }
}

impl<T: DeviceTransport, O: UpdateObserver + ?Sized> DeviceTransport
    for ObservableTransport<'_, T, O>
{
    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        self.inner.connect(host, port)?;
        self.observer.on_event(&UpdateEvent::Connected {
            host: host.to_string(),
            port,
        });
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<Response, TransportError> {
        let preview = &frame[..frame.len().min(TX_PREVIEW_LEN)];
        self.observer.on_event(&UpdateEvent::Packet {
            direction: PacketDirection::Tx,
            length: frame.len(),
            hex: Response::from_bytes(preview).to_string(),
        });

        let res = self.inner.send(frame);
        if let Ok(response) = &res {
            self.observer.on_event(&UpdateEvent::Packet {
                direction: PacketDirection::Rx,
                length: response.byte_len(),
                hex: response.to_string(),
            });
        }
        res
    }

    fn close(&mut self) {
        if self.inner.is_connected() {
            self.inner.close();
            self.observer.on_event(&UpdateEvent::Disconnected);
        } else {
            self.inner.close();
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}
