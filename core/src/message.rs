//! The closed set of messages this layer can put on the wire.

use std::net::IpAddr;

use time::OffsetDateTime;

use crate::auth::public_ip_hmac;
use crate::cert_verify::CertVerifyRequest;
use crate::codec::{encode_envelope, ip_octets, EncodeError, MessageType};
use crate::reply::HuntingTaskReplyKnownCert;
use crate::store::TaskTarget;

/// Per-task cap imposed by the one-byte hash count.
pub const MAX_KNOWN_CERTS: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    PublicIpNotification(PublicIpNotification),
    CurrentServerTime(CurrentServerTime),
    HuntingTask(HuntingTask),
    HuntingTaskReplyKnownCert(HuntingTaskReplyKnownCert),
    CertVerifyRequest(CertVerifyRequest),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::PublicIpNotification(m) => m.message_type(),
            Message::CurrentServerTime(_) => MessageType::CurrentServerTime,
            Message::HuntingTask(m) => m.message_type(),
            Message::HuntingTaskReplyKnownCert(_) => MessageType::TaskReplyKnownCert,
            Message::CertVerifyRequest(_) => MessageType::CertVerifyRequest,
        }
    }

    pub fn write_content(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        match self {
            Message::PublicIpNotification(m) => {
                m.write_content(out);
                Ok(())
            }
            Message::CurrentServerTime(m) => m.write_content(out),
            Message::HuntingTask(m) => m.write_content(out),
            Message::HuntingTaskReplyKnownCert(m) => m.write_content(out),
            Message::CertVerifyRequest(m) => {
                m.write_content(out);
                Ok(())
            }
        }
    }

    /// Full wire form: header followed by content.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut content = Vec::new();
        self.write_content(&mut content)?;
        encode_envelope(self.message_type(), &content)
    }
}

pub(crate) fn unix_seconds(t: OffsetDateTime) -> Result<u32, EncodeError> {
    let secs = t.unix_timestamp();
    u32::try_from(secs).map_err(|_| EncodeError::TimestampNotRepresentable(secs))
}

/// Tells a client which public IP the server saw, with the tag it must echo
/// back in hunting task replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIpNotification {
    pub public_ip: IpAddr,
    pub hmac: [u8; 32],
}

impl PublicIpNotification {
    pub fn issue(key: &[u8], public_ip: IpAddr) -> Self {
        PublicIpNotification { public_ip, hmac: public_ip_hmac(key, &public_ip) }
    }

    pub fn message_type(&self) -> MessageType {
        match self.public_ip {
            IpAddr::V4(_) => MessageType::PublicIpNotification4,
            IpAddr::V6(_) => MessageType::PublicIpNotification6,
        }
    }

    fn write_content(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hmac);
        out.extend_from_slice(&ip_octets(&self.public_ip));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentServerTime {
    pub now: OffsetDateTime,
}

impl CurrentServerTime {
    fn write_content(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        out.extend_from_slice(&unix_seconds(self.now)?.to_be_bytes());
        Ok(())
    }
}

/// An active-probing assignment for clients: connect to the target and report
/// the certificate seen there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuntingTask {
    pub task_id: u32,
    /// Chain-verified certificates already observed on the target; a client
    /// seeing one of these answers with a known-cert reply.
    pub known_cert_hashes: Vec<[u8; 32]>,
    pub target: TaskTarget,
}

impl HuntingTask {
    pub fn message_type(&self) -> MessageType {
        match self.target.ip {
            IpAddr::V4(_) => MessageType::Ipv4Sha256Task,
            IpAddr::V6(_) => MessageType::Ipv6Sha256Task,
        }
    }

    fn write_content(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        let count = self.known_cert_hashes.len();
        if count > MAX_KNOWN_CERTS {
            return Err(EncodeError::TooManyKnownCerts(count));
        }
        out.extend_from_slice(&self.task_id.to_be_bytes());
        out.push(count as u8);
        for hash in &self.known_cert_hashes {
            out.extend_from_slice(hash);
        }
        out.extend_from_slice(&ip_octets(&self.target.ip));
        out.extend_from_slice(&self.target.port.to_be_bytes());
        out.extend_from_slice(self.target.host.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_envelope;

    fn task(ip: &str, hashes: usize) -> HuntingTask {
        HuntingTask {
            task_id: 0x0102_0304,
            known_cert_hashes: (0..hashes).map(|i| [i as u8; 32]).collect(),
            target: TaskTarget { host: "www.example.org".into(), port: 443, ip: ip.parse().unwrap() },
        }
    }

    #[test]
    fn hunting_task_layout() {
        let bytes = Message::HuntingTask(task("203.0.113.9", 2)).encode().unwrap();
        let env = decode_envelope(&mut &bytes[..]).unwrap();
        assert_eq!(env.message_type, MessageType::Ipv4Sha256Task);
        let p = &env.payload;
        assert_eq!(&p[..4], &[1, 2, 3, 4]);
        assert_eq!(p[4], 2);
        assert_eq!(&p[5..37], &[0u8; 32]);
        assert_eq!(&p[37..69], &[1u8; 32]);
        assert_eq!(&p[69..73], &[203, 0, 113, 9]);
        assert_eq!(&p[73..75], &443u16.to_be_bytes());
        assert_eq!(&p[75..], b"www.example.org");
    }

    #[test]
    fn hunting_task_tag_follows_family() {
        let m = Message::HuntingTask(task("2001:db8::1", 0));
        assert_eq!(m.message_type(), MessageType::Ipv6Sha256Task);
        let env = decode_envelope(&mut &m.encode().unwrap()[..]).unwrap();
        assert_eq!(env.payload.len(), 4 + 1 + 16 + 2 + "www.example.org".len());
    }

    #[test]
    fn too_many_known_certs() {
        let err = Message::HuntingTask(task("203.0.113.9", 256)).encode().unwrap_err();
        assert_eq!(err, EncodeError::TooManyKnownCerts(256));
    }

    #[test]
    fn public_ip_notification_carries_tag() {
        let ip: IpAddr = "2001:db8::7".parse().unwrap();
        let note = PublicIpNotification::issue(b"key", ip);
        let env = decode_envelope(&mut &Message::PublicIpNotification(note.clone()).encode().unwrap()[..]).unwrap();
        assert_eq!(env.message_type, MessageType::PublicIpNotification6);
        assert_eq!(&env.payload[..32], &note.hmac);
        assert_eq!(env.payload.len(), 48);
    }

    #[test]
    fn server_time_before_epoch_fails() {
        let m = Message::CurrentServerTime(CurrentServerTime { now: OffsetDateTime::UNIX_EPOCH - time::Duration::seconds(1) });
        assert_eq!(m.encode().unwrap_err(), EncodeError::TimestampNotRepresentable(-1));
        let ok = Message::CurrentServerTime(CurrentServerTime { now: OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(258) });
        assert_eq!(ok.encode().unwrap(), vec![5, 0, 7, 0, 0, 1, 2]);
    }
}
