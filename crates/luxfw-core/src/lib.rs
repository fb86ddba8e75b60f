//! LuxFW-Core: firmware update protocol for inverters and BMS units behind a
//! WiFi datalogger.
//!
//! The host pushes a pre-downloaded, chunked firmware package to the device
//! over one TCP connection using three frame types (Prepare, SendData,
//! Reset), each sealed with a Modbus CRC16.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, CRC16, frame builders, response decoding
//! - **Package**: Firmware package model and TOML manifests
//! - **Transport**: TCP communication abstraction (tcp, mock)
//! - **State**: Transfer progress record
//! - **Events**: Observer pattern for UI decoupling
//! - **Updater**: High-level orchestrator and configuration
//!
//! # Example
//!
//! ```no_run
//! use luxfw_core::package::FirmwarePackage;
//! use luxfw_core::updater::{FirmwareUpdater, UpdaterConfig};
//!
//! let config = UpdaterConfig {
//!     inverter_sn: Some("BA12345678".to_string()),
//!     ..Default::default()
//! };
//! let package = FirmwarePackage::load_manifest("firmware.toml").expect("bad manifest");
//!
//! let mut updater = FirmwareUpdater::new(config);
//! updater.update_firmware(&package).expect("update failed");
//! ```

pub mod events;
pub mod package;
pub mod protocol;
pub mod state;
pub mod transport;
pub mod updater;

// Re-exports for convenience
pub use events::{
    LogLevel, NullObserver, TracingObserver, UpdateEvent, UpdateObserver, UpdatePhase,
};
pub use package::{FirmwarePackage, LuxExtras, PackageError, PackageManifest, ProtocolVariant};
pub use protocol::{DecodeError, DeviceId, FrameBuilder, FrameError, Response};
pub use state::{TransferProgress, TransferStatus};
pub use transport::{DeviceTransport, MockTransport, TcpTransport, TransportError};
pub use updater::{CancelToken, FirmwareUpdater, UpdateError, UpdateReport, UpdaterConfig};
