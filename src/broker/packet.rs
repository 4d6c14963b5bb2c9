//! MQTT 3.1.1 packet subset used by the broker.
//!
//! Only what the appliances and the automation hub actually send is decoded:
//! CONNECT, PUBLISH, PUBACK, SUBSCRIBE, UNSUBSCRIBE, PINGREQ and DISCONNECT.
//! Every packet can be encoded.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const DEFAULT_MAX_PACKET: usize = 1024 * 1024;

const TYPE_CONNECT: u8 = 1;
const TYPE_CONNACK: u8 = 2;
const TYPE_PUBLISH: u8 = 3;
const TYPE_PUBACK: u8 = 4;
const TYPE_SUBSCRIBE: u8 = 8;
const TYPE_SUBACK: u8 = 9;
const TYPE_UNSUBSCRIBE: u8 = 10;
const TYPE_UNSUBACK: u8 = 11;
const TYPE_PINGREQ: u8 = 12;
const TYPE_PINGRESP: u8 = 13;
const TYPE_DISCONNECT: u8 = 14;

const CONNECT_FLAG_USERNAME: u8 = 0x80;
const CONNECT_FLAG_PASSWORD: u8 = 0x40;
const CONNECT_FLAG_WILL_RETAIN: u8 = 0x20;
const CONNECT_FLAG_WILL: u8 = 0x04;
const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;

const PUBLISH_FLAG_DUP: u8 = 0x08;
const PUBLISH_FLAG_RETAIN: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("unsupported packet type {0}")]
    UnsupportedType(u8),
    #[error("unsupported protocol level {0}")]
    UnsupportedProtocol(u8),
    #[error("invalid remaining length")]
    InvalidRemainingLength,
    #[error("invalid qos {0}")]
    InvalidQos(u8),
    #[error("packet length {0} exceeds limit {1}")]
    TooLarge(usize, usize),
    #[error("string is not utf-8")]
    InvalidString,
    #[error("malformed packet: {0}")]
    Malformed(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_level: u8,
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    /// present when qos > 0
    pub packet_id: Option<u16>,
}

impl Publish {
    /// QoS 0 message, the only kind the broker itself originates.
    pub fn new(topic: &str, payload: impl Into<Vec<u8>>, retain: bool) -> Self {
        Self {
            topic: topic.to_owned(),
            payload: payload.into(),
            qos: 0,
            retain,
            dup: false,
            packet_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack { session_present: bool, code: u8 },
    Publish(Publish),
    Puback(u16),
    Subscribe { packet_id: u16, topics: Vec<(String, u8)> },
    Suback { packet_id: u16, granted: Vec<u8> },
    Unsubscribe { packet_id: u16, topics: Vec<String> },
    Unsuback(u16),
    Pingreq,
    Pingresp,
    Disconnect,
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, PacketError> {
    let bytes = read_binary(cursor)?;
    String::from_utf8(bytes).map_err(|_| PacketError::InvalidString)
}

fn read_binary(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, PacketError> {
    let len = cursor.read_u16::<BigEndian>()?;
    let mut out = vec![0; len as usize];
    cursor.read_exact(&mut out)?;
    Ok(out)
}

fn write_binary(out: &mut Vec<u8>, data: &[u8]) -> std::io::Result<()> {
    out.write_u16::<BigEndian>(data.len() as u16)?;
    out.write_all(data)
}

fn remaining(cursor: &Cursor<&[u8]>) -> bool {
    (cursor.position() as usize) < cursor.get_ref().len()
}

/// Decode variable length "remaining length" field.
/// Returns `None` when more bytes are needed.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, PacketError> {
    let mut value = 0usize;
    for (i, b) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(PacketError::InvalidRemainingLength);
        }
        value |= ((b & 0x7f) as usize) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 4 {
        return Err(PacketError::InvalidRemainingLength);
    }
    Ok(None)
}

fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut b = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            b |= 0x80;
        }
        out.push(b);
        if len == 0 {
            break;
        }
    }
}

impl Packet {
    /// Decode packet from fixed header byte and body (bytes after remaining length).
    pub fn decode(header: u8, body: &[u8]) -> Result<Self, PacketError> {
        let mut cursor = Cursor::new(body);
        let flags = header & 0xf;
        match header >> 4 {
            TYPE_CONNECT => Self::decode_connect(&mut cursor),
            TYPE_PUBLISH => {
                let qos = (flags >> 1) & 3;
                if qos == 3 {
                    return Err(PacketError::InvalidQos(qos));
                }
                let topic = read_string(&mut cursor)?;
                let packet_id = if qos > 0 {
                    Some(cursor.read_u16::<BigEndian>()?)
                } else {
                    None
                };
                let mut payload = Vec::new();
                cursor.read_to_end(&mut payload)?;
                Ok(Packet::Publish(Publish {
                    topic,
                    payload,
                    qos,
                    retain: flags & PUBLISH_FLAG_RETAIN != 0,
                    dup: flags & PUBLISH_FLAG_DUP != 0,
                    packet_id,
                }))
            }
            TYPE_PUBACK => Ok(Packet::Puback(cursor.read_u16::<BigEndian>()?)),
            TYPE_SUBSCRIBE => {
                let packet_id = cursor.read_u16::<BigEndian>()?;
                let mut topics = Vec::new();
                while remaining(&cursor) {
                    let topic = read_string(&mut cursor)?;
                    let qos = cursor.read_u8()?;
                    topics.push((topic, qos & 3));
                }
                Ok(Packet::Subscribe { packet_id, topics })
            }
            TYPE_UNSUBSCRIBE => {
                let packet_id = cursor.read_u16::<BigEndian>()?;
                let mut topics = Vec::new();
                while remaining(&cursor) {
                    topics.push(read_string(&mut cursor)?);
                }
                Ok(Packet::Unsubscribe { packet_id, topics })
            }
            TYPE_PINGREQ => Ok(Packet::Pingreq),
            TYPE_DISCONNECT => Ok(Packet::Disconnect),
            TYPE_CONNACK => {
                let ack_flags = cursor.read_u8()?;
                let code = cursor.read_u8()?;
                Ok(Packet::Connack {
                    session_present: ack_flags & 1 != 0,
                    code,
                })
            }
            TYPE_SUBACK => {
                let packet_id = cursor.read_u16::<BigEndian>()?;
                let mut granted = Vec::new();
                cursor.read_to_end(&mut granted)?;
                Ok(Packet::Suback { packet_id, granted })
            }
            TYPE_UNSUBACK => Ok(Packet::Unsuback(cursor.read_u16::<BigEndian>()?)),
            TYPE_PINGRESP => Ok(Packet::Pingresp),
            t => Err(PacketError::UnsupportedType(t)),
        }
    }

    fn decode_connect(cursor: &mut Cursor<&[u8]>) -> Result<Self, PacketError> {
        let _protocol_name = read_string(cursor)?;
        let protocol_level = cursor.read_u8()?;
        if protocol_level != 3 && protocol_level != 4 {
            return Err(PacketError::UnsupportedProtocol(protocol_level));
        }
        let flags = cursor.read_u8()?;
        let keep_alive = cursor.read_u16::<BigEndian>()?;
        let client_id = read_string(cursor)?;
        let will = if flags & CONNECT_FLAG_WILL != 0 {
            let topic = read_string(cursor)?;
            let payload = read_binary(cursor)?;
            Some(Will {
                topic,
                payload,
                qos: (flags >> 3) & 3,
                retain: flags & CONNECT_FLAG_WILL_RETAIN != 0,
            })
        } else {
            None
        };
        let username = if flags & CONNECT_FLAG_USERNAME != 0 {
            Some(read_string(cursor)?)
        } else {
            None
        };
        let password = if flags & CONNECT_FLAG_PASSWORD != 0 {
            Some(read_binary(cursor)?)
        } else {
            None
        };
        Ok(Packet::Connect(Connect {
            protocol_level,
            client_id,
            keep_alive,
            clean_session: flags & CONNECT_FLAG_CLEAN_SESSION != 0,
            will,
            username,
            password,
        }))
    }

    /// Encode packet including fixed header.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut body = Vec::new();
        let header = match self {
            Packet::Connect(c) => {
                write_binary(&mut body, b"MQTT")?;
                body.write_u8(c.protocol_level)?;
                let mut flags = 0;
                if c.clean_session {
                    flags |= CONNECT_FLAG_CLEAN_SESSION;
                }
                if let Some(w) = &c.will {
                    flags |= CONNECT_FLAG_WILL | (w.qos & 3) << 3;
                    if w.retain {
                        flags |= CONNECT_FLAG_WILL_RETAIN;
                    }
                }
                if c.username.is_some() {
                    flags |= CONNECT_FLAG_USERNAME;
                }
                if c.password.is_some() {
                    flags |= CONNECT_FLAG_PASSWORD;
                }
                body.write_u8(flags)?;
                body.write_u16::<BigEndian>(c.keep_alive)?;
                write_binary(&mut body, c.client_id.as_bytes())?;
                if let Some(w) = &c.will {
                    write_binary(&mut body, w.topic.as_bytes())?;
                    write_binary(&mut body, &w.payload)?;
                }
                if let Some(u) = &c.username {
                    write_binary(&mut body, u.as_bytes())?;
                }
                if let Some(p) = &c.password {
                    write_binary(&mut body, p)?;
                }
                TYPE_CONNECT << 4
            }
            Packet::Connack {
                session_present,
                code,
            } => {
                body.write_u8(*session_present as u8)?;
                body.write_u8(*code)?;
                TYPE_CONNACK << 4
            }
            Packet::Publish(p) => {
                write_binary(&mut body, p.topic.as_bytes())?;
                if p.qos > 0 {
                    body.write_u16::<BigEndian>(p.packet_id.unwrap_or(0))?;
                }
                body.write_all(&p.payload)?;
                let mut flags = (p.qos & 3) << 1;
                if p.retain {
                    flags |= PUBLISH_FLAG_RETAIN;
                }
                if p.dup {
                    flags |= PUBLISH_FLAG_DUP;
                }
                TYPE_PUBLISH << 4 | flags
            }
            Packet::Puback(id) => {
                body.write_u16::<BigEndian>(*id)?;
                TYPE_PUBACK << 4
            }
            Packet::Subscribe { packet_id, topics } => {
                body.write_u16::<BigEndian>(*packet_id)?;
                for (t, qos) in topics {
                    write_binary(&mut body, t.as_bytes())?;
                    body.write_u8(*qos)?;
                }
                TYPE_SUBSCRIBE << 4 | 2
            }
            Packet::Suback { packet_id, granted } => {
                body.write_u16::<BigEndian>(*packet_id)?;
                body.write_all(granted)?;
                TYPE_SUBACK << 4
            }
            Packet::Unsubscribe { packet_id, topics } => {
                body.write_u16::<BigEndian>(*packet_id)?;
                for t in topics {
                    write_binary(&mut body, t.as_bytes())?;
                }
                TYPE_UNSUBSCRIBE << 4 | 2
            }
            Packet::Unsuback(id) => {
                body.write_u16::<BigEndian>(*id)?;
                TYPE_UNSUBACK << 4
            }
            Packet::Pingreq => TYPE_PINGREQ << 4,
            Packet::Pingresp => TYPE_PINGRESP << 4,
            Packet::Disconnect => TYPE_DISCONNECT << 4,
        };
        let mut out = Vec::with_capacity(body.len() + 5);
        out.push(header);
        encode_remaining_length(body.len(), &mut out);
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Accumulates stream data and yields complete packets.
pub struct PacketReader {
    buf: Vec<u8>,
    max_packet: usize,
}

impl PacketReader {
    pub fn new(max_packet: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_packet,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete packet, `None` when more data is needed.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, PacketError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let (len, n) = match decode_remaining_length(&self.buf[1..])? {
            Some(v) => v,
            None => return Ok(None),
        };
        if len > self.max_packet {
            return Err(PacketError::TooLarge(len, self.max_packet));
        }
        let total = 1 + n + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let header = self.buf[0];
        let packet = Packet::decode(header, &self.buf[1 + n..total]);
        self.buf.drain(..total);
        packet.map(Some)
    }
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET)
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_remaining_length, Connect, Packet, PacketError, PacketReader, Publish, Will};

    #[test]
    fn remaining_length() {
        assert_eq!(decode_remaining_length(&[0x00]).unwrap(), Some((0, 1)));
        assert_eq!(decode_remaining_length(&[0x7f]).unwrap(), Some((127, 1)));
        assert_eq!(decode_remaining_length(&[0x80, 0x01]).unwrap(), Some((128, 2)));
        assert_eq!(decode_remaining_length(&[0xff, 0xff, 0xff, 0x7f]).unwrap(), Some((268_435_455, 4)));
        assert_eq!(decode_remaining_length(&[0x80]).unwrap(), None);
        assert!(decode_remaining_length(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
    }

    #[test]
    fn connect_with_will() {
        // client "dev1", keepalive 60, clean session, will a/b = "bye"
        let raw = hex::decode("101a00044d5154540406003c0004646576310003612f620003627965").unwrap();
        let mut r = PacketReader::default();
        r.push(&raw);
        let p = r.next_packet().unwrap().unwrap();
        assert_eq!(
            p,
            Packet::Connect(Connect {
                protocol_level: 4,
                client_id: "dev1".to_owned(),
                keep_alive: 60,
                clean_session: true,
                will: Some(Will {
                    topic: "a/b".to_owned(),
                    payload: b"bye".to_vec(),
                    qos: 0,
                    retain: false
                }),
                username: None,
                password: None,
            })
        );
        assert!(r.next_packet().unwrap().is_none());
    }

    #[test]
    fn publish_qos1_and_subscribe() {
        let publish = Packet::Publish(Publish {
            topic: "clip/message/devices/x".to_owned(),
            payload: b"{}".to_vec(),
            qos: 1,
            retain: true,
            dup: false,
            packet_id: Some(7),
        });
        let sub = Packet::Subscribe {
            packet_id: 8,
            topics: vec![("a/+".to_owned(), 0), ("b/#".to_owned(), 1)],
        };
        let mut stream = publish.encode().unwrap();
        stream.extend(sub.encode().unwrap());
        stream.extend(Packet::Pingreq.encode().unwrap());

        let mut r = PacketReader::default();
        // byte by byte to exercise partial reads
        let mut out = Vec::new();
        for b in stream {
            r.push(&[b]);
            while let Some(p) = r.next_packet().unwrap() {
                out.push(p);
            }
        }
        assert_eq!(out, vec![publish, sub, Packet::Pingreq]);
    }

    #[test]
    fn responses_encode() {
        assert_eq!(
            Packet::Connack { session_present: false, code: 0 }.encode().unwrap(),
            vec![0x20, 0x02, 0x00, 0x00]
        );
        assert_eq!(Packet::Puback(0x0102).encode().unwrap(), vec![0x40, 0x02, 0x01, 0x02]);
        assert_eq!(
            Packet::Suback { packet_id: 1, granted: vec![0, 0] }.encode().unwrap(),
            vec![0x90, 0x04, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(Packet::Pingresp.encode().unwrap(), vec![0xd0, 0x00]);
    }

    #[test]
    fn limits_and_errors() {
        let mut r = PacketReader::new(16);
        r.push(&Packet::Publish(Publish::new("t", vec![0u8; 32], false)).encode().unwrap());
        assert!(matches!(r.next_packet(), Err(PacketError::TooLarge(_, 16))));

        let mut r = PacketReader::default();
        r.push(&[0xf0, 0x00]);
        assert!(matches!(r.next_packet(), Err(PacketError::UnsupportedType(15))));

        let mut r = PacketReader::default();
        r.push(&[0x30, 0x03, 0x00, 0x05, b'a']);
        assert!(matches!(r.next_packet(), Err(PacketError::Malformed(_))));
    }
}
