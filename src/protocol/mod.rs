//! MQTT 3.1 wire codec, QoS 0 subset.
//!
//! CONNECT, CONNACK, SUBSCRIBE, SUBACK, UNSUBSCRIBE, UNSUBACK, PUBLISH,
//! PUBACK, PINGREQ, PINGRESP and DISCONNECT. Decode reads whole frames off
//! the stream; any malformed or oversize frame is fatal to the connection.
//! Encode always yields one contiguous buffer.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncReadExt;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame of {size} bytes exceeds the {max} byte cap")]
    FrameTooLarge { size: usize, max: usize },
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("unsupported packet type {0}")]
    UnsupportedPacket(u8),
    #[error("unsupported qos {0}")]
    UnsupportedQos(u8),
}

/// CONNACK return codes (MQTT 3.1 §3.2).
pub mod return_codes {
    pub const ACCEPTED: u8 = 0x00;
    pub const REFUSED_PROTOCOL: u8 = 0x01;
    pub const REFUSED_IDENTIFIER: u8 = 0x02;
    pub const SERVER_UNAVAILABLE: u8 = 0x03;
    pub const BAD_CREDENTIALS: u8 = 0x04;
    pub const NOT_AUTHORIZED: u8 = 0x05;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub keep_alive: u16,
    pub clean_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub message_id: u16,
    pub filters: Vec<String>,
    /// Set on the cluster receive path only; never on the client wire.
    pub is_forwarded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub message_id: u16,
    /// One grant per requested filter: 0x00 granted (QoS 0), 0x80 failure.
    pub grants: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub message_id: u16,
    pub filters: Vec<String>,
    pub is_forwarded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// 0 when absent on the wire (always, at QoS 0).
    pub message_id: u16,
    pub topic: String,
    pub payload: Bytes,
    pub is_forwarded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck { message_id: u16 },
    Publish(Publish),
    PubAck { message_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

/// Read one control packet. `max_packet` bounds the remaining length before
/// any allocation happens.
pub async fn read_packet<S: AsyncReadExt + Unpin>(
    stream: &mut S,
    max_packet: usize,
) -> Result<Packet, ProtocolError> {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;
    let packet_type = first[0] >> 4;
    let flags = first[0] & 0x0F;
    let remaining = decode_remaining_length(stream).await? as usize;
    if remaining > max_packet {
        return Err(ProtocolError::FrameTooLarge {
            size: remaining,
            max: max_packet,
        });
    }
    let mut buf = vec![0u8; remaining];
    stream.read_exact(&mut buf).await?;

    match packet_type {
        1 => parse_connect(&buf).map(Packet::Connect),
        2 => parse_connack(&buf).map(Packet::ConnAck),
        3 => parse_publish(flags, buf).map(Packet::Publish),
        4 => parse_message_id(&buf).map(|message_id| Packet::PubAck { message_id }),
        8 => parse_subscribe(&buf).map(Packet::Subscribe),
        9 => parse_suback(&buf).map(Packet::SubAck),
        10 => parse_unsubscribe(&buf).map(Packet::Unsubscribe),
        11 => parse_message_id(&buf).map(|message_id| Packet::UnsubAck { message_id }),
        12 => Ok(Packet::PingReq),
        13 => Ok(Packet::PingResp),
        14 => Ok(Packet::Disconnect),
        other => Err(ProtocolError::UnsupportedPacket(other)),
    }
}

impl Packet {
    /// Encode into a single contiguous frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Connect(c) => encode_connect(c),
            Packet::ConnAck(a) => frame(0x20, &[u8::from(a.session_present), a.code]),
            Packet::Subscribe(s) => encode_subscribe(s),
            Packet::SubAck(a) => {
                let mut body = Vec::with_capacity(2 + a.grants.len());
                body.extend_from_slice(&a.message_id.to_be_bytes());
                body.extend_from_slice(&a.grants);
                frame(0x90, &body)
            }
            Packet::Unsubscribe(u) => encode_unsubscribe(u),
            Packet::UnsubAck { message_id } => frame(0xB0, &message_id.to_be_bytes()),
            Packet::Publish(p) => encode_publish(p),
            Packet::PubAck { message_id } => frame(0x40, &message_id.to_be_bytes()),
            Packet::PingReq => vec![0xC0, 0x00],
            Packet::PingResp => vec![0xD0, 0x00],
            Packet::Disconnect => vec![0xE0, 0x00],
        }
    }
}

fn encode_connect(c: &Connect) -> Vec<u8> {
    let mut body = Vec::new();
    write_string(&mut body, "MQIsdp");
    body.push(3); // protocol level
    let mut connect_flags = 0u8;
    if c.clean_session {
        connect_flags |= 0x02;
    }
    if c.username.is_some() {
        connect_flags |= 0x80;
    }
    if c.password.is_some() {
        connect_flags |= 0x40;
    }
    body.push(connect_flags);
    body.extend_from_slice(&c.keep_alive.to_be_bytes());
    write_string(&mut body, &c.client_id);
    if let Some(username) = &c.username {
        write_string(&mut body, username);
    }
    if let Some(password) = &c.password {
        write_binary(&mut body, password);
    }
    frame(0x10, &body)
}

fn encode_subscribe(s: &Subscribe) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&s.message_id.to_be_bytes());
    for filter in &s.filters {
        write_string(&mut body, filter);
        body.push(0); // requested qos
    }
    frame(0x82, &body)
}

fn encode_unsubscribe(u: &Unsubscribe) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&u.message_id.to_be_bytes());
    for filter in &u.filters {
        write_string(&mut body, filter);
    }
    frame(0xA2, &body)
}

fn encode_publish(p: &Publish) -> Vec<u8> {
    let mut body = Vec::new();
    write_string(&mut body, &p.topic);
    body.extend_from_slice(&p.payload);
    frame(0x30, &body)
}

fn frame(first_byte: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(first_byte);
    encode_remaining_length(&mut out, body.len());
    out.extend_from_slice(body);
    out
}

fn parse_connect(buf: &[u8]) -> Result<Connect, ProtocolError> {
    let mut cursor = 0usize;
    let _protocol_name = read_string(buf, &mut cursor)?;
    let level = read_u8(buf, &mut cursor)?;
    if level != 3 && level != 4 {
        return Err(ProtocolError::Malformed("unsupported protocol level"));
    }
    let connect_flags = read_u8(buf, &mut cursor)?;
    let keep_alive = read_u16(buf, &mut cursor)?;
    let client_id = read_string(buf, &mut cursor)?;
    let clean_session = (connect_flags & 0x02) != 0;
    // Will messages are outside this broker's delivery model; the fields
    // still have to be consumed to reach the credentials.
    if (connect_flags & 0x04) != 0 {
        let _will_topic = read_string(buf, &mut cursor)?;
        let _will_payload = read_binary(buf, &mut cursor)?;
    }
    let username = if (connect_flags & 0x80) != 0 {
        Some(read_string(buf, &mut cursor)?)
    } else {
        None
    };
    let password = if (connect_flags & 0x40) != 0 {
        Some(read_binary(buf, &mut cursor)?)
    } else {
        None
    };
    Ok(Connect {
        client_id,
        username,
        password,
        keep_alive,
        clean_session,
    })
}

fn parse_connack(buf: &[u8]) -> Result<ConnAck, ProtocolError> {
    if buf.len() != 2 {
        return Err(ProtocolError::Malformed("connack body must be 2 bytes"));
    }
    Ok(ConnAck {
        session_present: (buf[0] & 0x01) != 0,
        code: buf[1],
    })
}

fn parse_publish(flags: u8, buf: Vec<u8>) -> Result<Publish, ProtocolError> {
    let qos = (flags & 0b0000_0110) >> 1;
    if qos != 0 {
        return Err(ProtocolError::UnsupportedQos(qos));
    }
    let mut cursor = 0usize;
    let topic = read_string(&buf, &mut cursor)?;
    let payload = Bytes::from(buf).slice(cursor..);
    Ok(Publish {
        message_id: 0,
        topic,
        payload,
        is_forwarded: false,
    })
}

fn parse_subscribe(buf: &[u8]) -> Result<Subscribe, ProtocolError> {
    let mut cursor = 0usize;
    let message_id = read_u16(buf, &mut cursor)?;
    let mut filters = Vec::new();
    while cursor < buf.len() {
        let filter = read_string(buf, &mut cursor)?;
        let _requested_qos = read_u8(buf, &mut cursor)?;
        filters.push(filter);
    }
    if filters.is_empty() {
        return Err(ProtocolError::Malformed("subscribe carries no filters"));
    }
    Ok(Subscribe {
        message_id,
        filters,
        is_forwarded: false,
    })
}

fn parse_suback(buf: &[u8]) -> Result<SubAck, ProtocolError> {
    let mut cursor = 0usize;
    let message_id = read_u16(buf, &mut cursor)?;
    Ok(SubAck {
        message_id,
        grants: buf[cursor..].to_vec(),
    })
}

fn parse_unsubscribe(buf: &[u8]) -> Result<Unsubscribe, ProtocolError> {
    let mut cursor = 0usize;
    let message_id = read_u16(buf, &mut cursor)?;
    let mut filters = Vec::new();
    while cursor < buf.len() {
        filters.push(read_string(buf, &mut cursor)?);
    }
    if filters.is_empty() {
        return Err(ProtocolError::Malformed("unsubscribe carries no filters"));
    }
    Ok(Unsubscribe {
        message_id,
        filters,
        is_forwarded: false,
    })
}

fn parse_message_id(buf: &[u8]) -> Result<u16, ProtocolError> {
    let mut cursor = 0usize;
    read_u16(buf, &mut cursor)
}

fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8, ProtocolError> {
    let v = *buf
        .get(*cursor)
        .ok_or(ProtocolError::Malformed("unexpected end of packet"))?;
    *cursor += 1;
    Ok(v)
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> Result<u16, ProtocolError> {
    if *cursor + 2 > buf.len() {
        return Err(ProtocolError::Malformed("unexpected end of packet"));
    }
    let v = u16::from_be_bytes([buf[*cursor], buf[*cursor + 1]]);
    *cursor += 2;
    Ok(v)
}

fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String, ProtocolError> {
    let raw = read_binary(buf, cursor)?;
    String::from_utf8(raw).map_err(|_| ProtocolError::Malformed("invalid utf8 in string"))
}

fn read_binary(buf: &[u8], cursor: &mut usize) -> Result<Vec<u8>, ProtocolError> {
    let len = read_u16(buf, cursor)? as usize;
    if *cursor + len > buf.len() {
        return Err(ProtocolError::Malformed("unexpected end of packet"));
    }
    let out = buf[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(out)
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn write_binary(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u16).to_be_bytes());
    buf.extend_from_slice(b);
}

fn encode_remaining_length(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

async fn decode_remaining_length<S: AsyncReadExt + Unpin>(
    stream: &mut S,
) -> Result<u32, ProtocolError> {
    let mut multiplier = 1u32;
    let mut value = 0u32;
    let mut read = 0;
    loop {
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await?;
        read += 1;
        if read > 4 {
            return Err(ProtocolError::Malformed("remaining length overruns"));
        }
        value = value.saturating_add((u32::from(buf[0]) & 0x7F) * multiplier);
        if (buf[0] & 0x80) == 0 {
            break;
        }
        multiplier = multiplier.saturating_mul(128);
    }
    Ok(value)
}
