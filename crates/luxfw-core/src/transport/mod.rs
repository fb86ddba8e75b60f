//! Transport layer module.

pub mod mock;
pub mod observable;
pub mod tcp;
pub mod traits;

pub use mock::{MockReply, MockTransport};
pub use observable::ObservableTransport;
pub use tcp::TcpTransport;
pub use traits::{DeviceTransport, TransportError};
