//! Register codecs: translate device payloads to register updates and back.

use anyhow::{Context, Result};

use crate::crc16;
use crate::frame::aabb;
use crate::tlv::{self, Tlv};

pub trait RegisterCodec: Send + Sync {
    /// Register updates carried by payload. Payloads not meant for us give nothing.
    fn decode(&mut self, payload: &[u8]) -> Vec<(u16, u32)>;
    /// Payload writing the given registers.
    fn encode_write(&self, registers: &[(u16, u32)]) -> Result<Vec<u8>>;
    /// Payload which makes the device report its full state.
    fn start(&self) -> Result<Option<Vec<u8>>>;
}

/// TLV records inside the binary envelope used by broker-attached appliances.
///
/// Inbound: `b0 b1 04 00 00 00 87 02 04 seq len <tlv...> crc crc`, where `len` counts the
/// TLV bytes. The trailing checksum is verified by the modem, not here.
/// Outbound: `b0 b1 04 00 00 00 65 b2 b3 b4 len <tlv...> crc crc` with the checksum
/// covering everything after `b0 b1`.
pub struct ClipTlvCodec;

const TLV_INBOUND_MAGIC: [u8; 7] = [0x04, 0x00, 0x00, 0x00, 0x87, 0x02, 0x04];
const TLV_ENVELOPE: usize = 13;
const TLV_QUERY: [u8; 5] = [1, 1, 2, 2, 1];
const TLV_WRITE: [u8; 5] = [1, 1, 2, 1, 1];
const TLV_QUERY_TAG: u16 = 0x1f5;

impl ClipTlvCodec {
    fn envelope(header: [u8; 5], records: &[Tlv]) -> Result<Vec<u8>> {
        let data = tlv::build(records).context("encoding tlv records")?;
        let len = u8::try_from(data.len()).context("tlv payload too long")?;
        let [b0, b1, b2, b3, b4] = header;
        let mut body = vec![0x04, 0x00, 0x00, 0x00, 0x65, b2, b3, b4, len];
        body.extend_from_slice(&data);
        let crc = crc16::checksum(&body);
        let mut out = Vec::with_capacity(body.len() + 4);
        out.push(b0);
        out.push(b1);
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc.to_be_bytes());
        Ok(out)
    }
}

impl RegisterCodec for ClipTlvCodec {
    fn decode(&mut self, payload: &[u8]) -> Vec<(u16, u32)> {
        if payload.len() < TLV_ENVELOPE
            || payload[2..9] != TLV_INBOUND_MAGIC
            || payload[10] as usize != payload.len() - TLV_ENVELOPE
        {
            log::debug!("not a tlv status packet: {}", hex::encode(payload));
            return Vec::new();
        }
        tlv::parse(&payload[11..payload.len() - 2])
            .into_iter()
            .map(|t| (t.tag, t.value))
            .collect()
    }

    fn encode_write(&self, registers: &[(u16, u32)]) -> Result<Vec<u8>> {
        let records: Vec<Tlv> = registers.iter().map(|(t, v)| Tlv::new(*t, *v)).collect();
        Self::envelope(TLV_WRITE, &records)
    }

    fn start(&self) -> Result<Option<Vec<u8>>> {
        Self::envelope(TLV_QUERY, &[Tlv::new(TLV_QUERY_TAG, 2)]).map(Some)
    }
}

/// Fixed-size status block inside `AA ... BB` frames, one register per status byte.
///
/// Status reports are `10 EB <status>` or `10 EC <previous> <current>`, writes are
/// `F0 17 <block>` with the written registers placed into a copy of the write template.
/// Unless set otherwise the template is `FF` for every status byte.
pub struct AabbStatusCodec {
    status_len: usize,
    start: &'static [u8],
    write_template: Option<&'static [u8]>,
}

const AABB_STATUS: [u8; 2] = [0x10, 0xeb];
const AABB_STATUS_CHANGE: [u8; 2] = [0x10, 0xec];
const AABB_WRITE: [u8; 2] = [0xf0, 0x17];
const AABB_UNSET: u8 = 0xff;

impl AabbStatusCodec {
    pub fn new(status_len: usize, start: &'static [u8]) -> Self {
        Self {
            status_len,
            start,
            write_template: None,
        }
    }

    /// Models whose write block differs in size or defaults from the status block.
    pub fn with_write_template(mut self, template: &'static [u8]) -> Self {
        self.write_template = Some(template);
        self
    }
}

impl RegisterCodec for AabbStatusCodec {
    fn decode(&mut self, payload: &[u8]) -> Vec<(u16, u32)> {
        let inner = match aabb::parse(payload) {
            Ok(inner) => inner,
            Err(e) => {
                log::debug!("dropping packet {}: {}", hex::encode(payload), e);
                return Vec::new();
            }
        };
        let n = self.status_len;
        let status = if inner.len() == 2 + 2 * n && inner[..2] == AABB_STATUS_CHANGE {
            &inner[2 + n..]
        } else if inner.len() == 2 + n && inner[..2] == AABB_STATUS {
            &inner[2..]
        } else {
            log::debug!("unhandled packet {}", hex::encode(inner));
            return Vec::new();
        };
        status
            .iter()
            .enumerate()
            .map(|(i, b)| (i as u16, *b as u32))
            .collect()
    }

    fn encode_write(&self, registers: &[(u16, u32)]) -> Result<Vec<u8>> {
        let mut status = match self.write_template {
            Some(t) => t.to_vec(),
            None => vec![AABB_UNSET; self.status_len],
        };
        for (id, value) in registers {
            let slot = status
                .get_mut(*id as usize)
                .context(format!("register {} outside status block", id))?;
            *slot = u8::try_from(*value).context(format!("value {} of register {} does not fit", value, id))?;
        }
        let mut inner = AABB_WRITE.to_vec();
        inner.extend_from_slice(&status);
        Ok(aabb::build(&inner)?)
    }

    fn start(&self) -> Result<Option<Vec<u8>>> {
        Ok(Some(aabb::build(self.start)?))
    }
}

/// Fixed-length report inside `AA ... BB` frames, identified by its first byte.
/// Every report byte is a register, writes are command bytes chosen by a model function.
pub struct AabbReportCodec {
    kind: u8,
    report_len: usize,
    command: fn(&[(u16, u32)]) -> Option<&'static [u8]>,
    start: &'static [u8],
}

impl AabbReportCodec {
    pub fn new(
        kind: u8,
        report_len: usize,
        command: fn(&[(u16, u32)]) -> Option<&'static [u8]>,
        start: &'static [u8],
    ) -> Self {
        Self {
            kind,
            report_len,
            command,
            start,
        }
    }
}

impl RegisterCodec for AabbReportCodec {
    fn decode(&mut self, payload: &[u8]) -> Vec<(u16, u32)> {
        let inner = match aabb::parse(payload) {
            Ok(inner) => inner,
            Err(e) => {
                log::debug!("dropping packet {}: {}", hex::encode(payload), e);
                return Vec::new();
            }
        };
        if inner.len() != self.report_len || inner[0] != self.kind {
            log::debug!("unhandled packet {}", hex::encode(inner));
            return Vec::new();
        }
        inner
            .iter()
            .enumerate()
            .map(|(i, b)| (i as u16, *b as u32))
            .collect()
    }

    fn encode_write(&self, registers: &[(u16, u32)]) -> Result<Vec<u8>> {
        let cmd = (self.command)(registers).context(format!("no command for registers {:?}", registers))?;
        Ok(aabb::build(cmd)?)
    }

    fn start(&self) -> Result<Option<Vec<u8>>> {
        Ok(Some(aabb::build(self.start)?))
    }
}

/// Raw status block of legacy appliances, one register per byte.
/// Writes are JSON command bodies produced by a model specific function.
pub struct ByteStatusCodec {
    status_len: usize,
    command: fn(&[(u16, u32)]) -> Option<serde_json::Value>,
    start: fn() -> serde_json::Value,
}

impl ByteStatusCodec {
    pub fn new(
        status_len: usize,
        command: fn(&[(u16, u32)]) -> Option<serde_json::Value>,
        start: fn() -> serde_json::Value,
    ) -> Self {
        Self {
            status_len,
            command,
            start,
        }
    }
}

impl RegisterCodec for ByteStatusCodec {
    fn decode(&mut self, payload: &[u8]) -> Vec<(u16, u32)> {
        if payload.len() != self.status_len {
            log::debug!("unexpected status length {}", payload.len());
            return Vec::new();
        }
        payload
            .iter()
            .enumerate()
            .map(|(i, b)| (i as u16, *b as u32))
            .collect()
    }

    fn encode_write(&self, registers: &[(u16, u32)]) -> Result<Vec<u8>> {
        let cmd = (self.command)(registers).context(format!("no command for registers {:?}", registers))?;
        Ok(serde_json::to_vec(&cmd)?)
    }

    fn start(&self) -> Result<Option<Vec<u8>>> {
        Ok(Some(serde_json::to_vec(&(self.start)())?))
    }
}

#[cfg(test)]
mod tests {
    use super::{AabbReportCodec, AabbStatusCodec, ByteStatusCodec, ClipTlvCodec, RegisterCodec};
    use crate::crc16;
    use crate::frame::aabb;
    use crate::tlv::{self, Tlv};

    fn inbound_tlv(records: &[Tlv]) -> Vec<u8> {
        let data = tlv::build(records).unwrap();
        let mut out = vec![0x01, 0x01, 0x04, 0x00, 0x00, 0x00, 0x87, 0x02, 0x04, 0x07, data.len() as u8];
        out.extend(data);
        out.extend([0xde, 0xad]);
        out
    }

    #[test]
    fn tlv_inbound() {
        let mut c = ClipTlvCodec;
        let pkt = inbound_tlv(&[Tlv::new(0x1fd, 44), Tlv::new(0x1f7, 1)]);
        assert_eq!(c.decode(&pkt), vec![(0x1fd, 44), (0x1f7, 1)]);

        // wrong magic or length byte
        let mut bad = pkt.clone();
        bad[6] = 0x65;
        assert!(c.decode(&bad).is_empty());
        let mut bad = pkt.clone();
        bad[10] += 1;
        assert!(c.decode(&bad).is_empty());
        assert!(c.decode(&[0x01]).is_empty());
    }

    #[test]
    fn tlv_outbound() {
        let c = ClipTlvCodec;
        let out = c.encode_write(&[(0x1fa, 5), (0x1f9, 0)]).unwrap();
        assert_eq!(&out[..2], &[1, 1]);
        assert_eq!(&out[2..11], &[0x04, 0x00, 0x00, 0x00, 0x65, 2, 1, 1, (out.len() - 13) as u8]);
        assert!(crc16::verify(&out[2..]));
        assert_eq!(
            tlv::parse(&out[11..out.len() - 2]),
            vec![Tlv::new(0x1fa, 5), Tlv::new(0x1f9, 0)]
        );

        let q = c.start().unwrap().unwrap();
        assert_eq!(&q[7..10], &[2, 2, 1]);
        assert_eq!(tlv::parse(&q[11..q.len() - 2]), vec![Tlv::new(0x1f5, 2)]);
    }

    const START: &[u8] = &[0xf0, 0xed, 0x12, 0x11, 0x01, 0x00, 0x00, 0x01, 0x04, 0x00];

    #[test]
    fn aabb_status() {
        let mut c = AabbStatusCodec::new(4, START);
        let mut inner = vec![0x10, 0xeb];
        inner.extend([9, 8, 7, 6]);
        assert_eq!(c.decode(&aabb::build(&inner).unwrap()), vec![(0, 9), (1, 8), (2, 7), (3, 6)]);

        let mut inner = vec![0x10, 0xec];
        inner.extend([0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(c.decode(&aabb::build(&inner).unwrap()), vec![(0, 1), (1, 2), (2, 3), (3, 4)]);

        // other packet types and truncated blocks
        assert!(c.decode(&aabb::build(&[0x10, 0xeb, 1]).unwrap()).is_empty());
        assert!(c.decode(&aabb::build(&[0x20, 0x01]).unwrap()).is_empty());
        assert!(c.decode(&[0x00, 0x01]).is_empty());
    }

    #[test]
    fn aabb_write() {
        let c = AabbStatusCodec::new(4, START);
        let out = c.encode_write(&[(1, 3), (3, 1)]).unwrap();
        assert_eq!(aabb::parse(&out).unwrap(), &[0xf0, 0x17, 0xff, 3, 0xff, 1]);
        assert!(c.encode_write(&[(4, 1)]).is_err());
        assert!(c.encode_write(&[(0, 256)]).is_err());
        assert_eq!(aabb::parse(&c.start().unwrap().unwrap()).unwrap(), START);
    }

    #[test]
    fn aabb_write_template() {
        const TEMPLATE: &[u8] = &[0xff, 0x00, 0xff, 0x1e, 0xff, 0xff];
        let c = AabbStatusCodec::new(4, START).with_write_template(TEMPLATE);
        let out = c.encode_write(&[(2, 7), (5, 1)]).unwrap();
        assert_eq!(aabb::parse(&out).unwrap(), &[0xf0, 0x17, 0xff, 0x00, 7, 0x1e, 0xff, 1]);
        assert!(c.encode_write(&[(6, 1)]).is_err());
    }

    #[test]
    fn aabb_report() {
        const STOP: &[u8] = &[0xf0, 0x24, 0x04, 0x01, 0x00];
        let mut c = AabbReportCodec::new(0x20, 4, |regs| (regs == [(0x100, 1)]).then_some(STOP), START);
        let pkt = aabb::build(&[0x20, 5, 6, 7]).unwrap();
        assert_eq!(c.decode(&pkt), vec![(0, 0x20), (1, 5), (2, 6), (3, 7)]);
        assert!(c.decode(&aabb::build(&[0x21, 5, 6, 7]).unwrap()).is_empty());
        assert!(c.decode(&aabb::build(&[0x20, 5, 6]).unwrap()).is_empty());

        assert_eq!(aabb::parse(&c.encode_write(&[(0x100, 1)]).unwrap()).unwrap(), STOP);
        assert!(c.encode_write(&[(0x100, 9)]).is_err());
        assert_eq!(aabb::parse(&c.start().unwrap().unwrap()).unwrap(), START);
    }

    #[test]
    fn byte_status() {
        let mut c = ByteStatusCodec::new(
            3,
            |regs| (regs == [(0, 0)]).then(|| serde_json::json!({"Cmd": "Off"})),
            || serde_json::json!({"Cmd": "Mon"}),
        );
        assert_eq!(c.decode(&[5, 6, 7]), vec![(0, 5), (1, 6), (2, 7)]);
        assert!(c.decode(&[5, 6]).is_empty());
        assert_eq!(c.encode_write(&[(0, 0)]).unwrap(), br#"{"Cmd":"Off"}"#.to_vec());
        assert!(c.encode_write(&[(0, 1)]).is_err());
        assert_eq!(c.start().unwrap().unwrap(), br#"{"Cmd":"Mon"}"#.to_vec());
    }
}
