use crate::models::{hash_from_hex, TaskRow, TASK_COLUMNS};
use crate::{Db, TaskId};
use anyhow::Result;
use certhunt_core::message::MAX_KNOWN_CERTS;
use certhunt_core::{HuntingTask, StoreError, TaskRecord, TaskStore};
use rusqlite::{params, OptionalExtension};

impl Db {
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let cnt: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?",
            [name],
            |r| r.get(0),
        )?;
        Ok(cnt > 0)
    }

    pub fn task_row(&self, task_id: TaskId) -> rusqlite::Result<Option<TaskRow>> {
        self.conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM hunting_tasks WHERE task_id=?"),
                [task_id],
                TaskRow::from_row,
            )
            .optional()
    }

    pub fn task_rows(&self, active_only: bool) -> rusqlite::Result<Vec<TaskRow>> {
        let sql = if active_only {
            format!("SELECT {TASK_COLUMNS} FROM hunting_tasks WHERE active=1 ORDER BY task_id")
        } else {
            format!("SELECT {TASK_COLUMNS} FROM hunting_tasks ORDER BY task_id")
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], TaskRow::from_row)?;
        rows.collect()
    }

    /// Chain-verified certificates seen on `host_port`, most recently observed first.
    pub fn known_cert_hashes(&self, host_port: &str) -> Result<Vec<[u8; 32]>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT sc.sha256_der_hash FROM server_certs AS sc
                 JOIN cert_observations AS co ON sc.sha256_der_hash = co.cert_hash
                 WHERE sc.cert_chain_md5 IS NOT NULL AND co.server_host_port = ?
                 GROUP BY sc.sha256_der_hash
                 ORDER BY MAX(co.observed_ms) DESC
                 LIMIT ?",
            )
            .map_err(StoreError::backend)?;
        let hashes = stmt
            .query_map(params![host_port, MAX_KNOWN_CERTS as i64], |r| r.get::<_, String>(0))
            .map_err(StoreError::backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::backend)?;
        hashes.iter().map(|h| hash_from_hex(h)).collect()
    }
}

impl TaskStore for Db {
    fn lookup_task(&self, task_id: u32) -> Result<Option<TaskRecord>, StoreError> {
        self.task_row(task_id)
            .map_err(StoreError::backend)?
            .map(TaskRow::into_record)
            .transpose()
    }

    fn list_active_tasks(&self) -> Result<Vec<HuntingTask>, StoreError> {
        let rows = self.task_rows(true).map_err(StoreError::backend)?;
        rows.into_iter()
            .map(|row| {
                let target = row.target()?;
                let known_cert_hashes = self.known_cert_hashes(&target.host_port())?;
                Ok(HuntingTask { task_id: row.task_id, known_cert_hashes, target })
            })
            .collect()
    }
}
