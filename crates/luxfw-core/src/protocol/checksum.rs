//! Modbus CRC16 used as the per-frame checksum.
//!
//! Reflected polynomial 0xA001, seed 0xFFFF. The table is built at compile
//! time so there is no runtime initialization and no shared mutable state.

const POLYNOMIAL: u16 = 0xA001;
const SEED: u16 = 0xFFFF;

const CRC_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x0001 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Byte order for rendering a 16-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

/// Compute the CRC16 of `data`.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(SEED, |crc, &byte| {
        (crc >> 8) ^ CRC_TABLE[((crc ^ byte as u16) & 0xFF) as usize]
    })
}

/// Compute the CRC16 of `length` bytes starting at `offset`.
///
/// Returns `None` if the range falls outside `data`.
pub fn checksum_range(data: &[u8], offset: usize, length: usize) -> Option<u16> {
    let end = offset.checked_add(length)?;
    data.get(offset..end).map(checksum)
}

/// Render a 16-bit value as two bytes in the requested order.
pub fn u16_to_bytes(value: u16, order: Endianness) -> [u8; 2] {
    match order {
        Endianness::Big => value.to_be_bytes(),
        Endianness::Little => value.to_le_bytes(),
    }
}
