use byteorder::{BigEndian, ByteOrder};

use super::FrameError;

pub const DEFAULT_MAX_PAYLOAD: usize = 65536;

/// Accumulates stream chunks and splits them into length-prefixed frames.
pub struct Splitter {
    pending: Vec<u8>,
    max_payload: usize,
}

impl Splitter {
    pub fn new(max_payload: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_payload,
        }
    }

    /// Feed chunk of stream data. Returns every frame completed by this chunk.
    /// Once an error is returned the stream is desynchronized and must be closed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= 4 {
            let len = BigEndian::read_u32(&self.pending[offset..offset + 4]) as usize;
            if len > self.max_payload {
                self.pending.clear();
                return Err(FrameError::TooLarge(len, self.max_payload));
            }
            if self.pending.len() - offset < 4 + len {
                break;
            }
            out.push(self.pending[offset + 4..offset + 4 + len].to_vec());
            offset += 4 + len;
        }
        self.pending.drain(..offset);
        Ok(out)
    }

    /// Number of bytes waiting for frame completion.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Splitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

/// Prefix payload with its big-endian length.
pub fn make(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
