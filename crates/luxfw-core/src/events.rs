//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other host) to follow an update without tight
//! coupling to the orchestrator.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Update phases as seen by an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    /// Opening the TCP connection.
    Connecting,
    /// Sending the Prepare frame.
    Prepare,
    /// SendData loop in progress.
    Transfer,
    /// Sending the Reset frame.
    Reset,
    /// Device accepted the new image.
    Complete,
    /// Update aborted.
    Error,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Connecting => write!(f, "Connecting"),
            UpdatePhase::Prepare => write!(f, "Prepare"),
            UpdatePhase::Transfer => write!(f, "Transfer"),
            UpdatePhase::Reset => write!(f, "Reset"),
            UpdatePhase::Complete => write!(f, "Complete"),
            UpdatePhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by the firmware updater.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// TCP connection established.
    Connected { host: String, port: u16 },
    /// Connection released.
    Disconnected,
    /// Phase changed.
    PhaseChanged { from: UpdatePhase, to: UpdatePhase },
    /// Device asked to continue from this package.
    Resumed { index: u16, standard_update: bool },
    /// Package `current` of `total` acknowledged.
    Progress { current: u16, total: u16 },
    /// Empty response or timeout; the package will be resent.
    Retry { index: u16, failures: u32 },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Frame sent/response received.
    Packet {
        direction: PacketDirection,
        length: usize,
        hex: String,
    },
    /// Update finished and the device accepted the image.
    Complete,
    /// Update failed; the connection has been released.
    Failed { message: String },
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::Connected { host, port } => {
                tracing::info!(host = %host, port = port, "Device connected");
            }
            UpdateEvent::Disconnected => {
                tracing::debug!("Device disconnected");
            }
            UpdateEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            UpdateEvent::Resumed {
                index,
                standard_update,
            } => {
                tracing::info!(index, standard_update, "Prepare acknowledged");
            }
            UpdateEvent::Progress { current, total } => {
                let pct = if *total > 0 {
                    (*current as u32 * 100) / *total as u32
                } else {
                    0
                };
                tracing::info!(current, total, progress = %format!("{}%", pct), "Progress");
            }
            UpdateEvent::Retry { index, failures } => {
                tracing::warn!(index, failures, "No response, retrying package");
            }
            UpdateEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            UpdateEvent::Packet {
                direction,
                length,
                hex,
            } => {
                tracing::trace!(dir = %direction, len = length, hex = %hex, "Packet");
            }
            UpdateEvent::Complete => {
                tracing::info!("Firmware update complete");
            }
            UpdateEvent::Failed { message } => {
                tracing::error!("Firmware update failed: {}", message);
            }
        }
    }
}
