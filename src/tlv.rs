//! Utilities to decode/encode appliance register tlv
//!
//! Every record starts with two bytes. The 10 bit tag is stored in the first byte and the two
//! upper bits of the second byte. Bits 4-5 of the second byte select how the value is stored:
//! `0` means the value is embedded in the low nibble, `1`..`3` means that many big-endian
//! value bytes follow.
//!
//! ```
//! # use cloudless::tlv;
//! # fn main() -> anyhow::Result<()> {
//! let data = tlv::build(&[tlv::Tlv { tag: 0x1f5, value: 2 }])?;
//! assert_eq!(data, vec![0x7d, 0x42]);
//! assert_eq!(tlv::parse(&data), vec![tlv::Tlv { tag: 0x1f5, value: 2 }]);
//! # Ok(())
//! # }
//! ```

use std::io::{Cursor, Read, Result};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const MAX_TAG: u16 = 0x3ff;
pub const MAX_VALUE: u32 = 0xff_ffff;

const LEN_EMBEDDED: u8 = 0;
const LEN_1: u8 = 1;
const LEN_2: u8 = 2;
const LEN_3: u8 = 3;

/// Single decoded register record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv {
    pub tag: u16,
    pub value: u32,
}

impl Tlv {
    pub fn new(tag: u16, value: u32) -> Self {
        Self { tag, value }
    }
}

/// Buffer to encode tlv records. Create buffer, write records then use data member.
pub struct TlvBuffer {
    pub data: Vec<u8>,
}

impl TlvBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(64),
        }
    }

    pub fn write(&mut self, tag: u16, value: u32) -> Result<()> {
        if tag > MAX_TAG {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("tlv tag 0x{:x} out of range", tag),
            ));
        }
        if value > MAX_VALUE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("tlv value 0x{:x} for tag 0x{:x} out of range", value, tag),
            ));
        }
        let len_class = match value {
            0..=0xf => LEN_EMBEDDED,
            0x10..=0xff => LEN_1,
            0x100..=0xffff => LEN_2,
            _ => LEN_3,
        };
        self.data.write_u8((tag >> 2) as u8)?;
        let low = ((tag & 3) as u8) << 6 | len_class << 4;
        match len_class {
            LEN_EMBEDDED => self.data.write_u8(low | value as u8)?,
            LEN_1 => {
                self.data.write_u8(low)?;
                self.data.write_u8(value as u8)?;
            }
            LEN_2 => {
                self.data.write_u8(low)?;
                self.data.write_u16::<BigEndian>(value as u16)?;
            }
            _ => {
                self.data.write_u8(low)?;
                self.data.write_u24::<BigEndian>(value)?;
            }
        }
        Ok(())
    }
}

impl Default for TlvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode records using shortest representation for each value.
pub fn build(items: &[Tlv]) -> Result<Vec<u8>> {
    let mut buf = TlvBuffer::new();
    for i in items {
        buf.write(i.tag, i.value)?;
    }
    Ok(buf.data)
}

fn read_record(cursor: &mut Cursor<&[u8]>) -> Result<Tlv> {
    let b0 = cursor.read_u8()?;
    let b1 = cursor.read_u8()?;
    let tag = (b0 as u16) << 2 | (b1 >> 6) as u16;
    let len_class = (b1 >> 4) & 3;
    let value = if len_class == LEN_EMBEDDED {
        (b1 & 0xf) as u32
    } else {
        let mut bytes = [0u8; 3];
        cursor.read_exact(&mut bytes[..len_class as usize])?;
        bytes[..len_class as usize]
            .iter()
            .fold(0u32, |acc, b| acc << 8 | *b as u32)
    };
    Ok(Tlv { tag, value })
}

/// Decode sequence of records.
///
/// A truncated trailing record is dropped and the records decoded so far are returned.
pub fn parse(data: &[u8]) -> Vec<Tlv> {
    let mut out = Vec::new();
    let mut cursor = Cursor::new(data);
    while (cursor.position() as usize) < data.len() {
        match read_record(&mut cursor) {
            Ok(t) => out.push(t),
            Err(_) => {
                log::debug!(
                    "tlv truncated at offset {} of {}, keeping {} records",
                    cursor.position(),
                    data.len(),
                    out.len()
                );
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{build, parse, Tlv, TlvBuffer};

    #[test]
    fn minimal_encoding() {
        let o = build(&[Tlv { tag: 0x1fe, value: 5 }]).unwrap();
        assert_eq!(o, vec![0x7f, 0x85]);

        let o = build(&[Tlv { tag: 0x1fe, value: 44 }]).unwrap();
        assert_eq!(o, vec![0x7f, 0x90, 44]);

        let o = build(&[Tlv { tag: 1, value: 0x1234 }]).unwrap();
        assert_eq!(o, vec![0x00, 0x60, 0x12, 0x34]);

        let o = build(&[Tlv { tag: 0x3ff, value: 0xabcdef }]).unwrap();
        assert_eq!(o, vec![0xff, 0xf0, 0xab, 0xcd, 0xef]);
    }

    #[test]
    fn round_trip_edges() {
        let tags = [0u16, 1, 2, 3, 0x1f5, 0x3fe, 0x3ff];
        let values = [0u32, 1, 0xf, 0x10, 0xff, 0x100, 0xffff, 0x10000, 0xff_ffff];
        for tag in tags {
            for value in values {
                let t = Tlv { tag, value };
                assert_eq!(parse(&build(&[t]).unwrap()), vec![t]);
            }
        }
    }

    #[test]
    fn multiple_records() {
        let items = vec![
            Tlv { tag: 0x1f9, value: 0 },
            Tlv { tag: 0x1fa, value: 3 },
            Tlv { tag: 0x1fe, value: 44 },
        ];
        let data = build(&items).unwrap();
        assert_eq!(parse(&data), items);
    }

    #[test]
    fn truncated_tail_keeps_prefix() {
        let mut data = build(&[Tlv { tag: 0x1fd, value: 48 }]).unwrap();
        // second record declares 2 value bytes, only 1 present
        data.extend_from_slice(&[0x7e, 0x20, 0x01]);
        assert_eq!(parse(&data), vec![Tlv { tag: 0x1fd, value: 48 }]);

        // lone trailing byte
        let data = [0x7f, 0x85, 0x7f];
        assert_eq!(parse(&data), vec![Tlv { tag: 0x1fe, value: 5 }]);
    }

    #[test]
    fn out_of_range() {
        let mut buf = TlvBuffer::new();
        assert!(buf.write(0x400, 1).is_err());
        assert!(buf.write(1, 0x100_0000).is_err());
        assert!(buf.data.is_empty());
    }
}
