//! Shared message framing: a one-byte type tag, a two-byte big-endian length
//! and a type-specific payload.
//!
//! The length field counts the whole message, header included, so a message
//! with an `n` byte payload declares `n + 3`.

use std::io::{ErrorKind, Read};
use std::net::IpAddr;

use thiserror::Error;

/// Tag byte plus the two length bytes.
pub const HEADER_LEN: usize = 3;

/// Largest payload whose framed length still fits the length field.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    PublicIpNotification4 = 0,
    PublicIpNotification6 = 1,
    PublicIpNotificationRequest = 2,
    CurrentServerTime = 5,
    Ipv4Sha256Task = 10,
    Ipv6Sha256Task = 11,
    TaskReplyNewCert = 20,
    TaskReplyKnownCert = 21,
    CertVerifyRequest = 100,
    CertVerifyResult = 110,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => MessageType::PublicIpNotification4,
            1 => MessageType::PublicIpNotification6,
            2 => MessageType::PublicIpNotificationRequest,
            5 => MessageType::CurrentServerTime,
            10 => MessageType::Ipv4Sha256Task,
            11 => MessageType::Ipv6Sha256Task,
            20 => MessageType::TaskReplyNewCert,
            21 => MessageType::TaskReplyKnownCert,
            100 => MessageType::CertVerifyRequest,
            110 => MessageType::CertVerifyResult,
            other => return Err(FrameError::UnknownMessageType(other)),
        })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream ended while reading {what}: needed {needed} bytes, got {got}")]
    TruncatedStream { what: &'static str, needed: usize, got: usize },
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unexpected message type {found:?}, expected {expected:?}")]
    UnexpectedMessageType { expected: MessageType, found: MessageType },
    #[error("declared message length {0} is shorter than the header")]
    LengthTooShort(u16),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("payload of {len} bytes does not fit the length field (max {MAX_PAYLOAD_LEN})")]
    PayloadTooLarge { len: usize },
    #[error("timestamp {0} cannot be sent as unsigned 32-bit unix seconds")]
    TimestampNotRepresentable(i64),
    #[error("{0} known certificate hashes exceed the per-task limit of 255")]
    TooManyKnownCerts(usize),
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub length: u16,
}

impl Header {
    /// Bytes that follow the header.
    pub fn payload_len(&self) -> usize {
        usize::from(self.length) - HEADER_LEN
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

/// Read exactly `buf.len()` bytes, reporting how far we got on a short stream.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8], what: &'static str) -> Result<(), FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(FrameError::TruncatedStream { what, needed: buf.len(), got: filled }),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn read_tag<R: Read + ?Sized>(reader: &mut R) -> Result<MessageType, FrameError> {
    let mut tag = [0u8; 1];
    read_full(reader, &mut tag, "message type")?;
    MessageType::try_from(tag[0])
}

fn read_length<R: Read + ?Sized>(reader: &mut R) -> Result<u16, FrameError> {
    let mut len = [0u8; 2];
    read_full(reader, &mut len, "message length")?;
    let length = u16::from_be_bytes(len);
    if usize::from(length) < HEADER_LEN {
        return Err(FrameError::LengthTooShort(length));
    }
    Ok(length)
}

pub fn read_header<R: Read + ?Sized>(reader: &mut R) -> Result<Header, FrameError> {
    let message_type = read_tag(reader)?;
    let length = read_length(reader)?;
    Ok(Header { message_type, length })
}

/// Like [`read_header`], but rejects any other message type before the
/// length is consumed.
pub fn read_header_of<R: Read + ?Sized>(reader: &mut R, expected: MessageType) -> Result<Header, FrameError> {
    let found = read_tag(reader)?;
    if found != expected {
        return Err(FrameError::UnexpectedMessageType { expected, found });
    }
    let length = read_length(reader)?;
    Ok(Header { message_type: found, length })
}

pub fn decode_envelope<R: Read + ?Sized>(reader: &mut R) -> Result<Envelope, FrameError> {
    let header = read_header(reader)?;
    let mut payload = vec![0u8; header.payload_len()];
    read_full(reader, &mut payload, "message payload")?;
    Ok(Envelope { message_type: header.message_type, payload })
}

pub fn encode_envelope(message_type: MessageType, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(EncodeError::PayloadTooLarge { len: payload.len() });
    }
    let total = (payload.len() + HEADER_LEN) as u16;
    let mut out = Vec::with_capacity(usize::from(total));
    out.push(message_type.tag());
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a concatenated message stream (e.g. a serialized MessageList).
pub fn split_messages(mut bytes: &[u8]) -> Result<Vec<Envelope>, FrameError> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        out.push(decode_envelope(&mut bytes)?);
    }
    Ok(out)
}

pub(crate) fn ip_octets(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}
