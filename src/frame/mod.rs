//! Byte level framing used by the different appliance generations.
//!
//! - [length_prefixed] - 4 byte big-endian length followed by payload (legacy TCP stream)
//! - [aabb] - `AA len ... sum BB` frames carried inside clip packets
//! - [mtosp] - `AA len16 ... crc16 BB` frames with text payload
//! - [json] - back to back JSON documents without delimiter (appliance setup port)
//!
//! Streaming parsers keep bounded state and fail instead of growing without limit.

pub mod aabb;
pub mod json;
pub mod length_prefixed;
pub mod mtosp;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid header byte 0x{0:02x}")]
    InvalidHeader(u8),
    #[error("invalid trailer byte 0x{0:02x}")]
    InvalidTrailer(u8),
    #[error("invalid checksum")]
    InvalidChecksum,
    #[error("frame length {declared} does not match buffer length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload length {0} exceeds limit {1}")]
    TooLarge(usize, usize),
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("invalid json document: {0}")]
    InvalidJson(String),
}
