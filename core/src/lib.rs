//! Message layer of the certificate hunting service: wire framing, the
//! client-submitted messages and their validation, and the batching of
//! server messages into one response stream.

pub mod auth;
pub mod cert_verify;
pub mod clock;
pub mod codec;
pub mod message;
pub mod message_list;
pub mod reply;
pub mod store;

pub use cert_verify::{CertVerifyRequest, CertVerifyRequestError};
pub use clock::{Clock, FixedClock, SystemClock};
pub use codec::{decode_envelope, encode_envelope, split_messages, EncodeError, Envelope, FrameError, MessageType};
pub use message::{CurrentServerTime, HuntingTask, Message, PublicIpNotification};
pub use message_list::{get_current_hunting_task_list, store_task_list_cache, MessageList, TaskListError};
pub use reply::{AcceptedReply, HuntingTaskReply, HuntingTaskReplyKnownCert, ReplyError, ReplyPolicy};
pub use store::{CacheStore, CacheTransaction, CachedTaskList, CertStore, NewObservation, ObservationId, StoreError, TaskRecord, TaskStore, TaskTarget};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }
}
