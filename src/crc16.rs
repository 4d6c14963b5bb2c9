//! 16-bit checksum shared by the TLV envelope and mtosp frames.
//!
//! CRC-16 with polynomial 0x1021, zero initial value, no reflection and no final xor.
//! Appending the big-endian checksum to a buffer and recomputing over the extended
//! buffer yields zero, which is how receivers validate frames.

const POLY: u16 = 0x1021;

/// Compute checksum over `data`.
pub fn checksum(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for b in data {
        crc ^= (*b as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Append big-endian checksum of current buffer content.
pub fn append(data: &mut Vec<u8>) {
    let crc = checksum(data);
    data.extend_from_slice(&crc.to_be_bytes());
}

/// Returns true if buffer ends with valid checksum of preceding bytes.
pub fn verify(data: &[u8]) -> bool {
    data.len() >= 2 && checksum(data) == 0
}
