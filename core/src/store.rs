//! Persistence seams. The core never touches a database directly; it talks to
//! these traits and gets plain structs back.

use std::net::IpAddr;

use thiserror::Error;
use time::OffsetDateTime;

use crate::message::HuntingTask;

pub type ObservationId = i64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failed: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }
}

/// Where a hunting task points its clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTarget {
    pub host: String,
    pub port: u16,
    pub ip: IpAddr,
}

impl TaskTarget {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A persisted hunting task as seen by reply validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_id: u32,
    pub target: TaskTarget,
    /// False once the task stops accepting replies.
    pub active: bool,
    pub hmac_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewObservation {
    pub cert_hash_hex: String,
    pub server_host_port: String,
    pub server_ip: IpAddr,
    pub observed_at: OffsetDateTime,
    pub observer_type: &'static str,
    pub observer_ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedTaskList {
    pub data: Vec<u8>,
    pub valid_until: OffsetDateTime,
}

pub trait TaskStore {
    fn lookup_task(&self, task_id: u32) -> Result<Option<TaskRecord>, StoreError>;

    fn list_active_tasks(&self) -> Result<Vec<HuntingTask>, StoreError>;
}

pub trait CertStore {
    /// Is there a certificate with this hash whose chain has been resolved?
    fn find_verified_cert(&self, cert_hash: &[u8; 32]) -> Result<bool, StoreError>;

    fn has_observation(&self, cert_hash: &[u8; 32], server_host_port: &str) -> Result<bool, StoreError>;

    fn record_observation(&self, observation: &NewObservation) -> Result<ObservationId, StoreError>;

    fn record_task_result(&self, task_id: u32, trace: &str, observation_id: ObservationId) -> Result<(), StoreError>;

    /// An observation and the task result pointing at it. Backends with
    /// transactions should write both or neither.
    fn record_task_observation(&self, task_id: u32, trace: &str, observation: &NewObservation) -> Result<ObservationId, StoreError> {
        let observation_id = self.record_observation(observation)?;
        self.record_task_result(task_id, trace, observation_id)?;
        Ok(observation_id)
    }
}

/// Storage for the single hunting-task-list cache row.
pub trait CacheStore {
    type Tx<'a>: CacheTransaction
    where
        Self: 'a;

    fn load_task_list_cache(&self) -> Result<Option<CachedTaskList>, StoreError>;

    fn begin(&self) -> Result<Self::Tx<'_>, StoreError>;
}

pub trait CacheTransaction {
    /// Returns the number of rows changed.
    fn update(&mut self, data: &[u8], valid_until: OffsetDateTime) -> Result<usize, StoreError>;

    fn insert(&mut self, data: &[u8], valid_until: OffsetDateTime) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;
}
