//! Universal Data Packet framing.
//!
//! Layout of a packet inside one 32-byte page:
//! - Byte 0: data length (0-29)
//! - Bytes 1..=len: data
//! - Two bytes: inverted CRC16, low byte first
//!
//! The CRC is seeded with the page number, so a packet copied to another
//! page no longer verifies.

use super::PageNumber;
use crate::error::{OwfsError, OwfsResult};

/// Largest data length that fits a 32-byte page with framing.
pub const MAX_PACKET_DATA: usize = 29;

/// CRC16 value left after running the check over a valid packet.
pub const CRC16_RESIDUE: u16 = 0xB001;

/// Feed one byte through the 1-Wire CRC16 (reflected polynomial 0xA001).
pub fn crc16_update(mut crc: u16, byte: u8) -> u16 {
    crc ^= byte as u16;
    for _ in 0..8 {
        if crc & 1 != 0 {
            crc = (crc >> 1) ^ 0xA001;
        } else {
            crc >>= 1;
        }
    }
    crc
}

/// CRC16 over a byte slice starting from `seed`.
pub fn crc16(seed: u16, data: &[u8]) -> u16 {
    data.iter().fold(seed, |crc, &b| crc16_update(crc, b))
}

/// Frame `data` as a packet for `page`.
pub fn encode_packet(page: PageNumber, data: &[u8]) -> OwfsResult<Vec<u8>> {
    if data.len() > MAX_PACKET_DATA {
        return Err(OwfsError::InvalidPacketLength {
            page,
            len: data.len(),
        });
    }
    let mut packet = Vec::with_capacity(data.len() + 3);
    packet.push(data.len() as u8);
    packet.extend_from_slice(data);
    let crc = !crc16(page as u16, &packet);
    packet.push((crc & 0xFF) as u8);
    packet.push((crc >> 8) as u8);
    Ok(packet)
}

/// Decode the packet at the start of a raw page.
pub fn decode_packet(page: PageNumber, raw: &[u8]) -> OwfsResult<Vec<u8>> {
    let len = *raw.first().ok_or(OwfsError::InvalidPacketLength { page, len: 0 })? as usize;
    if len > MAX_PACKET_DATA || len + 3 > raw.len() {
        return Err(OwfsError::InvalidPacketLength { page, len });
    }
    if crc16(page as u16, &raw[..len + 3]) != CRC16_RESIDUE {
        return Err(OwfsError::CrcMismatch(page));
    }
    Ok(raw[1..=len].to_vec())
}
