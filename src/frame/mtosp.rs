//! Text frames: `AA <len:u16 be> <payload> <crc:u16 be> BB`.
//!
//! The checksum covers header and payload, so the running checksum over the frame up to and
//! including the crc bytes is zero. Unlike [super::aabb], the receiver validates everything.

use super::FrameError;
use crate::crc16;

const HEADER: u8 = 0xaa;
const TRAILER: u8 = 0xbb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitHeader,
    LengthHigh,
    LengthLow,
    Payload(usize),
    ChecksumHigh,
    ChecksumLow,
    AwaitTrailer,
}

/// Byte-at-a-time parser.
pub struct Splitter {
    state: State,
    buf: Vec<u8>,
    max_payload: usize,
}

impl Splitter {
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: State::AwaitHeader,
            buf: Vec::new(),
            max_payload,
        }
    }

    fn reset(&mut self) {
        self.state = State::AwaitHeader;
        self.buf.clear();
    }

    fn fail(&mut self, e: FrameError) -> Result<Option<String>, FrameError> {
        self.reset();
        Err(e)
    }

    /// Feed one byte, returns payload text when byte completes a frame.
    pub fn push_byte(&mut self, byte: u8) -> Result<Option<String>, FrameError> {
        self.buf.push(byte);
        match self.state {
            State::AwaitHeader => {
                if byte != HEADER {
                    return self.fail(FrameError::InvalidHeader(byte));
                }
                self.state = State::LengthHigh;
            }
            State::LengthHigh => self.state = State::LengthLow,
            State::LengthLow => {
                let len = (self.buf[1] as usize) << 8 | byte as usize;
                if len > self.max_payload {
                    return self.fail(FrameError::TooLarge(len, self.max_payload));
                }
                self.state = if len == 0 {
                    State::ChecksumHigh
                } else {
                    State::Payload(len)
                };
            }
            State::Payload(remaining) => {
                self.state = if remaining > 1 {
                    State::Payload(remaining - 1)
                } else {
                    State::ChecksumHigh
                };
            }
            State::ChecksumHigh => self.state = State::ChecksumLow,
            State::ChecksumLow => {
                if !crc16::verify(&self.buf) {
                    return self.fail(FrameError::InvalidChecksum);
                }
                self.state = State::AwaitTrailer;
            }
            State::AwaitTrailer => {
                if byte != TRAILER {
                    return self.fail(FrameError::InvalidTrailer(byte));
                }
                let text = String::from_utf8_lossy(&self.buf[3..self.buf.len() - 3]).into_owned();
                self.reset();
                return Ok(Some(text));
            }
        }
        Ok(None)
    }

    /// Feed chunk, returns every completed payload.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, FrameError> {
        let mut out = Vec::new();
        for b in chunk {
            if let Some(text) = self.push_byte(*b)? {
                out.push(text);
            }
        }
        Ok(out)
    }
}

impl Default for Splitter {
    fn default() -> Self {
        Self::new(u16::MAX as usize)
    }
}

/// Build frame around text payload.
pub fn format(text: &str) -> Result<Vec<u8>, FrameError> {
    let payload = text.as_bytes();
    if payload.len() > u16::MAX as usize {
        return Err(FrameError::TooLarge(payload.len(), u16::MAX as usize));
    }
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.push(HEADER);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    crc16::append(&mut out);
    out.push(TRAILER);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{format, Splitter};
    use crate::frame::FrameError;

    const XML: &str = "<?xml version=\"1.0\"?><mtosp><cmd>getInfo</cmd></mtosp>";

    #[test]
    fn round_trip() {
        let mut s = Splitter::default();
        let frame = format(XML).unwrap();
        assert_eq!(s.push(&frame).unwrap(), vec![XML.to_owned()]);

        // back to back frames, including empty payload
        let mut stream = format("").unwrap();
        stream.extend(format("abc").unwrap());
        assert_eq!(s.push(&stream).unwrap(), vec!["".to_owned(), "abc".to_owned()]);
    }

    #[test]
    fn split_across_chunks() {
        let mut s = Splitter::default();
        let frame = format(XML).unwrap();
        let (a, b) = frame.split_at(10);
        assert!(s.push(a).unwrap().is_empty());
        assert_eq!(s.push(b).unwrap(), vec![XML.to_owned()]);
    }

    #[test]
    fn corrupted_payload_byte() {
        let frame = format(XML).unwrap();
        for i in 3..frame.len() - 3 {
            let mut bad = frame.clone();
            bad[i] ^= 0x01;
            let mut s = Splitter::default();
            assert_eq!(s.push(&bad), Err(FrameError::InvalidChecksum), "offset {}", i);
        }
    }

    #[test]
    fn bad_sentinels() {
        let mut s = Splitter::default();
        assert_eq!(s.push(&[0x00]), Err(FrameError::InvalidHeader(0x00)));

        let mut frame = format("x").unwrap();
        let n = frame.len();
        frame[n - 1] = 0xcc;
        assert_eq!(s.push(&frame), Err(FrameError::InvalidTrailer(0xcc)));

        // parser recovers after error
        assert_eq!(s.push(&format("ok").unwrap()).unwrap(), vec!["ok".to_owned()]);
    }

    #[test]
    fn length_limit() {
        let mut s = Splitter::new(4);
        assert_eq!(s.push(&format("too long").unwrap()), Err(FrameError::TooLarge(8, 4)));
    }
}
