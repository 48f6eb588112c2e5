//! Wire codec: little-endian integer helpers and the page checksum.
//!
//! All multi-byte integers in CANnuccia payloads are little-endian. The page
//! checksum is CRC-16/XMODEM (poly 0x1021, init 0x0000, no reflection, no
//! final XOR), which must match the device bootloader's computation exactly.

use byteorder::{ByteOrder, LittleEndian};
use crc::{CRC_16_XMODEM, Crc};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC-16/XMODEM of `data`, as exchanged in WRITES_CHECKED.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Reads a little-endian u16; caller guarantees `buf.len() >= 2`.
pub fn read_u16_le(buf: &[u8]) -> u16 {
    LittleEndian::read_u16(buf)
}

/// Reads a little-endian u32; caller guarantees `buf.len() >= 4`.
pub fn read_u32_le(buf: &[u8]) -> u32 {
    LittleEndian::read_u32(buf)
}

/// Encodes a u32 as its little-endian payload bytes.
pub fn u32_le_bytes(value: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, value);
    buf
}
