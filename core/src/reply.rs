//! Replies to hunting tasks.
//!
//! A known-cert reply claims that the certificate a client saw for a task's
//! target is one the server has already verified there. Layout:
//!
//! | offset | field | size |
//! |---|---|---|
//! | 0 | task id | 4, big-endian |
//! | 4 | server time of execution | 4, big-endian unix seconds |
//! | 8 | HMAC of the client's public IP | 32 |
//! | 40 | SHA-256 of the observed certificate | 32 |
//! | 72 | trace to the target | rest |
//!
//! Every field is client controlled. Decoding checks it against the
//! persisted task before anything is kept: the task must exist and still be
//! open, the timestamp must be recent, the trace must start at an IP the
//! server vouched for, and the certificate must already be verified on the
//! task's `host:port`.

use std::io::Read;
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::auth::verify_public_ip_hmac;
use crate::clock::{checked_after, checked_before, Clock};
use crate::codec::{read_full, read_header_of, EncodeError, FrameError, MessageType};
use crate::message::unix_seconds;
use crate::store::{CertStore, NewObservation, ObservationId, StoreError, TaskStore, TaskTarget};

/// Task id, timestamp, HMAC and certificate hash.
pub const KNOWN_CERT_FIXED_LEN: usize = 4 + 4 + 32 + 32;

/// Observer type recorded for observations made by hunting clients.
pub const HUNTER_OBSERVER: &str = "CertHunter";

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("reply of {len} bytes is shorter than the {KNOWN_CERT_FIXED_LEN} byte fixed part")]
    TruncatedMessage { len: usize },
    #[error("no hunting task with id {0}")]
    UnknownTask(u32),
    #[error("claimed execution time {0} is outside the accepted window")]
    TimestampOutOfRange(OffsetDateTime),
    #[error("malformed trace: {0}")]
    MalformedTrace(String),
    #[error("public IP HMAC does not match the trace's first hop")]
    InvalidTraceHmac,
    #[error("certificate {0} is not verified for this task's target")]
    UnknownOrUnverifiedCertificate(String),
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

/// Acceptance limits for replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPolicy {
    /// How far in the past the claimed execution time may lie.
    pub max_age: Duration,
    /// Tolerated client clock drift into the future.
    pub max_future_skew: Duration,
    pub max_trace_hops: usize,
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        ReplyPolicy {
            max_age: Duration::from_secs(24 * 60 * 60),
            max_future_skew: Duration::from_secs(5 * 60),
            max_trace_hops: 64,
        }
    }
}

impl ReplyPolicy {
    /// A bound that falls outside the representable range leaves that side open.
    pub fn timestamp_in_window(&self, claimed: OffsetDateTime, now: OffsetDateTime) -> bool {
        let not_too_old = checked_before(now, self.max_age).map_or(true, |oldest| oldest <= claimed);
        let not_too_new = checked_after(now, self.max_future_skew).map_or(true, |latest| claimed <= latest);
        not_too_old && not_too_new
    }
}

/// Wire content of a known-cert reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuntingTaskReplyKnownCert {
    pub task_id: u32,
    pub server_time_of_execution: OffsetDateTime,
    pub pub_ip_hmac: [u8; 32],
    pub server_cert_hash: [u8; 32],
    pub trace: String,
}

impl HuntingTaskReplyKnownCert {
    /// Structural parse only; see [`HuntingTaskReply::decode`] for validation.
    pub fn parse(raw: &[u8]) -> Result<Self, ReplyError> {
        if raw.len() < KNOWN_CERT_FIXED_LEN {
            return Err(ReplyError::TruncatedMessage { len: raw.len() });
        }
        let task_id = read_task_id(raw);
        let secs = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let server_time_of_execution = OffsetDateTime::from_unix_timestamp(i64::from(secs))
            .map_err(|_| ReplyError::TimestampOutOfRange(OffsetDateTime::UNIX_EPOCH))?;
        let mut pub_ip_hmac = [0u8; 32];
        pub_ip_hmac.copy_from_slice(&raw[8..40]);
        let mut server_cert_hash = [0u8; 32];
        server_cert_hash.copy_from_slice(&raw[40..72]);
        let trace = std::str::from_utf8(&raw[72..])
            .map_err(|_| ReplyError::MalformedTrace("not valid UTF-8".into()))?
            .to_string();
        Ok(HuntingTaskReplyKnownCert { task_id, server_time_of_execution, pub_ip_hmac, server_cert_hash, trace })
    }

    pub fn write_content(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        out.extend_from_slice(&self.task_id.to_be_bytes());
        out.extend_from_slice(&unix_seconds(self.server_time_of_execution)?.to_be_bytes());
        out.extend_from_slice(&self.pub_ip_hmac);
        out.extend_from_slice(&self.server_cert_hash);
        out.extend_from_slice(self.trace.as_bytes());
        Ok(())
    }

    pub fn cert_hash_hex(&self) -> String {
        hex::encode(self.server_cert_hash)
    }
}

fn read_task_id(raw: &[u8]) -> u32 {
    u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
}

/// A reply that passed every check and may be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedReply {
    pub content: HuntingTaskReplyKnownCert,
    pub target: TaskTarget,
    /// Address the reply was received from.
    pub observer_ip: IpAddr,
}

/// Outcome of decoding a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HuntingTaskReply {
    /// The task exists but no longer takes replies. Not an error; storing it
    /// does nothing.
    Inactive { task_id: u32 },
    KnownCert(AcceptedReply),
}

impl HuntingTaskReply {
    /// Decode and validate a known-cert reply payload (the bytes after the
    /// message header).
    pub fn decode<S>(
        raw: &[u8],
        observer_ip: IpAddr,
        store: &S,
        clock: &dyn Clock,
        policy: &ReplyPolicy,
    ) -> Result<Self, ReplyError>
    where
        S: TaskStore + CertStore + ?Sized,
    {
        if raw.len() < KNOWN_CERT_FIXED_LEN {
            return Err(ReplyError::TruncatedMessage { len: raw.len() });
        }
        let task_id = read_task_id(raw);
        let task = store.lookup_task(task_id)?.ok_or(ReplyError::UnknownTask(task_id))?;
        if !task.active {
            debug!(task_id, "ignoring reply to inactive hunting task");
            return Ok(HuntingTaskReply::Inactive { task_id });
        }

        let content = HuntingTaskReplyKnownCert::parse(raw)?;
        let result = validate(&content, &task.target, &task.hmac_key, store, clock, policy);
        if let Err(e) = &result {
            warn!(task_id, %observer_ip, error = %e, "rejected hunting task reply");
        }
        result?;

        debug!(task_id, target = %task.target.host_port(), "accepted known-cert reply");
        Ok(HuntingTaskReply::KnownCert(AcceptedReply { content, target: task.target, observer_ip }))
    }

    /// Read one framed known-cert reply from `reader` and decode it.
    pub fn read_from<R, S>(
        reader: &mut R,
        observer_ip: IpAddr,
        store: &S,
        clock: &dyn Clock,
        policy: &ReplyPolicy,
    ) -> Result<Self, ReplyError>
    where
        R: Read + ?Sized,
        S: TaskStore + CertStore + ?Sized,
    {
        let header = read_header_of(reader, MessageType::TaskReplyKnownCert)?;
        let mut payload = vec![0u8; header.payload_len()];
        read_full(reader, &mut payload, "hunting task reply")?;
        Self::decode(&payload, observer_ip, store, clock, policy)
    }

    pub fn task_id(&self) -> u32 {
        match self {
            HuntingTaskReply::Inactive { task_id } => *task_id,
            HuntingTaskReply::KnownCert(r) => r.content.task_id,
        }
    }

    /// Persist the observation and the task result. Returns the observation id,
    /// or `None` for replies to inactive tasks.
    pub fn store<S: CertStore + ?Sized>(&self, store: &S) -> Result<Option<ObservationId>, StoreError> {
        let HuntingTaskReply::KnownCert(reply) = self else {
            return Ok(None);
        };
        let observation = NewObservation {
            cert_hash_hex: reply.content.cert_hash_hex(),
            server_host_port: reply.target.host_port(),
            server_ip: reply.target.ip,
            observed_at: reply.content.server_time_of_execution,
            observer_type: HUNTER_OBSERVER,
            observer_ip: reply.observer_ip,
        };
        let observation_id = store.record_task_observation(reply.content.task_id, &reply.content.trace, &observation)?;
        Ok(Some(observation_id))
    }
}

fn validate<S>(
    content: &HuntingTaskReplyKnownCert,
    target: &TaskTarget,
    hmac_key: &[u8],
    store: &S,
    clock: &dyn Clock,
    policy: &ReplyPolicy,
) -> Result<(), ReplyError>
where
    S: CertStore + ?Sized,
{
    if !policy.timestamp_in_window(content.server_time_of_execution, clock.now()) {
        return Err(ReplyError::TimestampOutOfRange(content.server_time_of_execution));
    }
    validate_trace(&content.trace, &content.pub_ip_hmac, target, hmac_key, policy.max_trace_hops)?;
    validate_known_cert(&content.server_cert_hash, &target.host_port(), store)
}

/// Parse a trace: one hop per line, each hop one or more `|` separated IPs.
pub fn parse_trace(trace: &str, max_hops: usize) -> Result<Vec<Vec<IpAddr>>, ReplyError> {
    let mut hops = Vec::new();
    for line in trace.lines() {
        if hops.len() == max_hops {
            return Err(ReplyError::MalformedTrace(format!("more than {max_hops} hops")));
        }
        let hop = line
            .split('|')
            .map(|ip| ip.trim().parse::<IpAddr>().map_err(|_| ReplyError::MalformedTrace(format!("bad address {ip:?}"))))
            .collect::<Result<Vec<_>, _>>()?;
        hops.push(hop);
    }
    if hops.is_empty() {
        return Err(ReplyError::MalformedTrace("empty trace".into()));
    }
    Ok(hops)
}

fn validate_trace(trace: &str, pub_ip_hmac: &[u8; 32], target: &TaskTarget, hmac_key: &[u8], max_hops: usize) -> Result<(), ReplyError> {
    let hops = parse_trace(trace, max_hops)?;
    let public_ip = match hops[0].as_slice() {
        [ip] => *ip,
        _ => return Err(ReplyError::MalformedTrace("first hop must be a single public IP".into())),
    };
    if public_ip.is_ipv4() != target.ip.is_ipv4() {
        return Err(ReplyError::MalformedTrace("first hop and target differ in address family".into()));
    }
    if !verify_public_ip_hmac(hmac_key, &public_ip, pub_ip_hmac) {
        return Err(ReplyError::InvalidTraceHmac);
    }
    let reaches_target = hops.last().is_some_and(|hop| hop.contains(&target.ip));
    if !reaches_target {
        return Err(ReplyError::MalformedTrace(format!("trace does not end at {}", target.ip)));
    }
    Ok(())
}

fn validate_known_cert<S: CertStore + ?Sized>(cert_hash: &[u8; 32], host_port: &str, store: &S) -> Result<(), ReplyError> {
    if store.find_verified_cert(cert_hash)? && store.has_observation(cert_hash, host_port)? {
        return Ok(());
    }
    Err(ReplyError::UnknownOrUnverifiedCertificate(hex::encode(cert_hash)))
}
