//! State machine module.

pub mod progress;

pub use progress::{TransferProgress, TransferStatus};
