//! Protocol module - update frame definitions.

pub mod checksum;
pub mod constants;
pub mod frame;
pub mod response;

pub use checksum::{Endianness, checksum, checksum_range, u16_to_bytes};
pub use constants::*;
pub use frame::{AddressField, DeviceId, FrameBuilder, FrameError, FrameKind};
pub use response::{
    DecodeError, Response, decode_reset_status, decode_resume_index, decode_standard_update_flag,
};
