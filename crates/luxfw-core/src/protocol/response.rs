//! Device responses and fixed-offset field decoding.
//!
//! The transport renders every received byte as two uppercase hex
//! characters. Decoders read byte offsets out of that text and must never
//! index past its end.

use std::fmt;
use std::fmt::Write as _;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Response too short for {field}: need {needed} bytes, got {actual}")]
    ResponseTooShort {
        field: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("Invalid hex at byte {offset}")]
    InvalidHex { offset: usize },
}

/// One raw device response in hex text form.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Response {
    hex: String,
}

impl Response {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hex = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            // Writing into a String cannot fail.
            let _ = write!(hex, "{:02X}", b);
        }
        Self { hex }
    }

    /// Wrap an existing hex string (e.g. from a capture log).
    pub fn from_hex(hex: &str) -> Self {
        Self {
            hex: hex.trim().to_ascii_uppercase(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    pub fn is_empty(&self) -> bool {
        self.hex.is_empty()
    }

    /// Number of complete bytes in the response.
    pub fn byte_len(&self) -> usize {
        self.hex.len() / 2
    }

    fn require(&self, field: &'static str, needed: usize) -> Result<(), DecodeError> {
        let actual = self.byte_len();
        if actual < needed {
            return Err(DecodeError::ResponseTooShort {
                field,
                needed,
                actual,
            });
        }
        Ok(())
    }

    fn byte(&self, offset: usize) -> Result<u8, DecodeError> {
        self.hex
            .get(offset * 2..offset * 2 + 2)
            .and_then(|pair| u8::from_str_radix(pair, 16).ok())
            .ok_or(DecodeError::InvalidHex { offset })
    }

    /// Read one byte at `offset`.
    pub fn byte_at(&self, field: &'static str, offset: usize) -> Result<u8, DecodeError> {
        self.require(field, offset + 1)?;
        self.byte(offset)
    }

    /// Read a little-endian u16 at `offset`.
    pub fn u16_le_at(&self, field: &'static str, offset: usize) -> Result<u16, DecodeError> {
        self.require(field, offset + 2)?;
        let bytes = [self.byte(offset)?, self.byte(offset + 1)?];
        Ok(LittleEndian::read_u16(&bytes))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Response({})", self.hex)
    }
}

/// Package index the device wants next, from a Prepare response.
///
/// Values of 0 or at/after `package_count` mean "start over" and decode to 1.
pub fn decode_resume_index(response: &Response, package_count: u16) -> Result<u16, DecodeError> {
    let raw = response.u16_le_at("resume index", RESUME_INDEX_OFFSET)?;
    if raw == 0 || raw >= package_count {
        Ok(1)
    } else {
        Ok(raw)
    }
}

/// Whether the device reports a fully standard update (`'A'`).
pub fn decode_standard_update_flag(response: &Response) -> Result<bool, DecodeError> {
    let flag = response.byte_at("standard-update flag", STANDARD_UPDATE_FLAG_OFFSET)?;
    Ok(flag == STANDARD_UPDATE_FLAG)
}

/// Status byte of a Reset response.
pub fn decode_reset_status(response: &Response) -> Result<u8, DecodeError> {
    response.byte_at("reset status", RESET_STATUS_OFFSET)
}
