//! `AA <len> <inner...> <sum> BB` frames.
//!
//! `len` is total frame length including sentinels. `sum` is the low byte of the sum of all
//! preceding bytes, xored with 0x55. Only outgoing frames compute the checksum, incoming
//! frames are checked for sentinels and length.

use super::FrameError;

pub const HEADER: u8 = 0xaa;
pub const TRAILER: u8 = 0xbb;
const OVERHEAD: usize = 4;

/// Wrap inner payload into frame.
pub fn build(inner: &[u8]) -> Result<Vec<u8>, FrameError> {
    let total = inner.len() + OVERHEAD;
    if total > u8::MAX as usize {
        return Err(FrameError::TooLarge(total, u8::MAX as usize));
    }
    let mut out = Vec::with_capacity(total);
    out.push(HEADER);
    out.push(total as u8);
    out.extend_from_slice(inner);
    let sum = out.iter().fold(0u32, |acc, b| acc + *b as u32);
    out.push((sum & 0xff) as u8 ^ 0x55);
    out.push(TRAILER);
    Ok(out)
}

/// Validate sentinels and length byte, return inner payload.
pub fn parse(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < OVERHEAD {
        return Err(FrameError::TooShort(frame.len()));
    }
    if frame[0] != HEADER {
        return Err(FrameError::InvalidHeader(frame[0]));
    }
    let last = frame[frame.len() - 1];
    if last != TRAILER {
        return Err(FrameError::InvalidTrailer(last));
    }
    let declared = frame[1] as usize;
    if declared != frame.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: frame.len(),
        });
    }
    Ok(&frame[2..frame.len() - 2])
}

#[cfg(test)]
mod tests {
    use super::{build, parse};
    use crate::frame::FrameError;

    #[test]
    fn checksum_and_trailer() {
        let inner = hex::decode("F0ED1211010000010400").unwrap();
        let f = build(&inner).unwrap();
        assert_eq!(f[0], 0xaa);
        assert_eq!(f[1] as usize, f.len());
        let sum: u32 = f[..f.len() - 2].iter().map(|b| *b as u32).sum();
        assert_eq!(f[f.len() - 2], (sum & 0xff) as u8 ^ 0x55);
        assert_eq!(f[f.len() - 1], 0xbb);
    }

    #[test]
    fn known_frame() {
        // AA 06 01 02 sum BB: sum = aa+06+01+02 = b3, b3^55 = e6
        assert_eq!(build(&[1, 2]).unwrap(), vec![0xaa, 0x06, 0x01, 0x02, 0xe6, 0xbb]);
    }

    #[test]
    fn parse_ignores_checksum() {
        let mut f = build(&[0x10, 0xeb, 0x01]).unwrap();
        let n = f.len();
        f[n - 2] ^= 0xff;
        assert_eq!(parse(&f).unwrap(), &[0x10, 0xeb, 0x01]);
    }

    #[test]
    fn parse_rejects_bad_sentinels() {
        assert_eq!(parse(&[0xab, 4, 0, 0xbb]), Err(FrameError::InvalidHeader(0xab)));
        assert_eq!(parse(&[0xaa, 4, 0, 0xbc]), Err(FrameError::InvalidTrailer(0xbc)));
        assert_eq!(
            parse(&[0xaa, 5, 0, 0xbb]),
            Err(FrameError::LengthMismatch { declared: 5, actual: 4 })
        );
        assert_eq!(parse(&[0xaa, 0xbb]), Err(FrameError::TooShort(2)));
    }
}
