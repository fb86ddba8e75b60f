//! Update frame encoding.
//!
//! Every frame starts with `0x00, opcode, serial[10]` and ends with the
//! CRC16 of all preceding bytes, little-endian. Multi-byte fields are
//! little-endian.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::checksum::{Endianness, checksum, u16_to_bytes};
use super::constants::*;
use crate::package::{FirmwarePackage, ProtocolVariant};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Package {index} payload too large: {len} bytes (max {max})", max = crate::package::MAX_CHUNK_SIZE)]
    PayloadTooLarge { index: u16, len: usize },
    #[error("No physical address for package {index}")]
    MissingPhysicalAddress { index: u16 },
}

/// Frame kinds sent by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Prepare,
    SendData,
    Reset,
}

impl FrameKind {
    pub fn opcode(&self) -> u8 {
        match self {
            FrameKind::Prepare => OP_UPDATE_PREPARE,
            FrameKind::SendData => OP_UPDATE_SEND_DATA,
            FrameKind::Reset => OP_UPDATE_RESET,
        }
    }
}

/// 10-byte ASCII device serial as it appears on the wire.
///
/// Longer serials are truncated, shorter ones zero-padded. Non-ASCII
/// characters are encoded as `?`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    pub fn new(serial: &str) -> Self {
        let mut id = [0u8; DEVICE_ID_LEN];
        for (slot, c) in id.iter_mut().zip(serial.chars()) {
            *slot = if c.is_ascii() { c as u8 } else { b'?' };
        }
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(DEVICE_ID_LEN);
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId(\"{}\")", self)
    }
}

/// Contents of the 4-byte field at offset 17 of a SendData frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressField {
    /// Standard: physical address (file type 2) or file size (1/3).
    Address(u32),
    /// Lux: raw length table.
    LengthTable([u8; 4]),
}

impl AddressField {
    /// Resolve the field for `index` per the package's variant and file type.
    pub fn for_package(package: &FirmwarePackage, index: u16) -> Result<Self, FrameError> {
        match &package.variant {
            ProtocolVariant::Lux(extras) => Ok(AddressField::LengthTable(extras.length_table)),
            ProtocolVariant::Standard => match package.file_type {
                2 => package
                    .physical_addresses
                    .get(&index)
                    .map(|&addr| AddressField::Address(addr))
                    .ok_or(FrameError::MissingPhysicalAddress { index }),
                1 | 3 => Ok(AddressField::Address(package.file_size)),
                _ => Ok(AddressField::Address(0)),
            },
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        match self {
            AddressField::Address(addr) => LittleEndian::write_u32(buf, *addr),
            AddressField::LengthTable(table) => buf.copy_from_slice(table),
        }
    }
}

fn new_frame(kind: FrameKind, device: &DeviceId, len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; len];
    frame[1] = kind.opcode();
    frame[DEVICE_ID_OFFSET..DEVICE_ID_OFFSET + DEVICE_ID_LEN].copy_from_slice(device.as_bytes());
    frame
}

fn seal(frame: &mut [u8]) {
    let body = frame.len() - CRC_LEN;
    let crc = checksum(&frame[..body]);
    frame[body..].copy_from_slice(&u16_to_bytes(crc, Endianness::Little));
}

/// Build a Prepare (0x21) frame. 24 bytes.
pub fn build_prepare(
    device: &DeviceId,
    tail_marker: &[u8; 4],
    package_count: u16,
    checksum32: u32,
) -> Vec<u8> {
    let mut frame = new_frame(FrameKind::Prepare, device, PREPARE_FRAME_LEN);
    frame[12..16].copy_from_slice(tail_marker);
    LittleEndian::write_u16(&mut frame[16..18], package_count);
    LittleEndian::write_u32(&mut frame[18..22], checksum32);
    seal(&mut frame);
    frame
}

/// Build a SendData (0x22) frame. `payload.len() + 23` bytes.
pub fn build_send_data(
    device: &DeviceId,
    index: u16,
    file_type: u8,
    field: &AddressField,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let length_field = u16::try_from(payload.len() + SEND_DATA_LEN_EXTRA).map_err(|_| {
        FrameError::PayloadTooLarge {
            index,
            len: payload.len(),
        }
    })?;

    let total = SEND_DATA_HEADER_LEN + payload.len() + CRC_LEN;
    let mut frame = new_frame(FrameKind::SendData, device, total);
    LittleEndian::write_u16(&mut frame[12..14], index);
    frame[14] = file_type;
    LittleEndian::write_u16(&mut frame[15..17], length_field);
    field.write_to(&mut frame[17..21]);
    frame[SEND_DATA_HEADER_LEN..SEND_DATA_HEADER_LEN + payload.len()].copy_from_slice(payload);
    seal(&mut frame);
    Ok(frame)
}

/// Build a Reset (0x23) frame. 21 bytes.
pub fn build_reset(device: &DeviceId, file_type: u8, reset_count: u16, checksum32: u32) -> Vec<u8> {
    let mut frame = new_frame(FrameKind::Reset, device, RESET_FRAME_LEN);
    frame[12] = file_type;
    LittleEndian::write_u16(&mut frame[13..15], reset_count);
    LittleEndian::write_u32(&mut frame[15..19], checksum32);
    seal(&mut frame);
    frame
}

/// Variant-aware frame construction for one package.
pub struct FrameBuilder<'a> {
    device: DeviceId,
    package: &'a FirmwarePackage,
    package_count: u16,
}

impl<'a> FrameBuilder<'a> {
    pub fn new(device: DeviceId, package: &'a FirmwarePackage) -> Self {
        Self {
            device,
            package,
            package_count: package.package_count(),
        }
    }

    /// Prepare frame. The Lux dialect shares the Standard layout.
    pub fn prepare(&self) -> Vec<u8> {
        build_prepare(
            &self.device,
            &self.package.tail_marker,
            self.package_count,
            self.package.checksum32,
        )
    }

    pub fn send_data(&self, index: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let field = AddressField::for_package(self.package, index)?;
        build_send_data(&self.device, index, self.package.file_type, &field, payload)
    }

    /// Reset frame. `bms_header_id` overrides the count in both dialects.
    pub fn reset(&self) -> Vec<u8> {
        build_reset(
            &self.device,
            self.package.file_type,
            self.package.reset_count(self.package_count),
            self.package.checksum32,
        )
    }
}
