use certhunt_core::{StoreError, TaskRecord, TaskTarget};
use rusqlite::Row;
use serde::Serialize;
use time::OffsetDateTime;

pub type TaskId = u32;

/// One row of `hunting_tasks`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRow {
    pub task_id: TaskId,
    pub target_host: String,
    pub target_port: u16,
    pub target_ip: String,
    #[serde(skip)]
    pub hmac_key: Vec<u8>,
    pub active: bool,
    pub created_ms: i64,
}

pub(crate) const TASK_COLUMNS: &str = "task_id, target_host, target_port, target_ip, hmac_key, active, created_ms";

impl TaskRow {
    pub(crate) fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(TaskRow {
            task_id: r.get(0)?,
            target_host: r.get(1)?,
            target_port: r.get(2)?,
            target_ip: r.get(3)?,
            hmac_key: r.get(4)?,
            active: r.get(5)?,
            created_ms: r.get(6)?,
        })
    }

    pub fn target(&self) -> Result<TaskTarget, StoreError> {
        let ip = self
            .target_ip
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("task {} has target ip {:?}", self.task_id, self.target_ip)))?;
        Ok(TaskTarget { host: self.target_host.clone(), port: self.target_port, ip })
    }

    pub fn into_record(self) -> Result<TaskRecord, StoreError> {
        let target = self.target()?;
        Ok(TaskRecord { task_id: self.task_id, target, active: self.active, hmac_key: self.hmac_key })
    }
}

pub(crate) fn to_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_ms(ms: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|e| StoreError::Corrupt(format!("timestamp {ms}: {e}")))
}

pub(crate) fn hash_from_hex(s: &str) -> Result<[u8; 32], StoreError> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out).map_err(|e| StoreError::Corrupt(format!("certificate hash {s:?}: {e}")))?;
    Ok(out)
}
