use crate::models::{from_ms, to_ms};
use crate::Db;
use certhunt_core::{CacheStore, CacheTransaction, CachedTaskList, StoreError};
use rusqlite::{params, OptionalExtension, Transaction};
use time::OffsetDateTime;
use tracing::{debug, warn};

/// Transaction over the cache row. Dropping it uncommitted rolls back.
pub struct SqliteCacheTx<'a> {
    // None once committed or rolled back
    tx: Option<Transaction<'a>>,
}

impl SqliteCacheTx<'_> {
    fn open(&self) -> Result<&Transaction<'_>, StoreError> {
        self.tx.as_ref().ok_or_else(|| StoreError::Corrupt("cache transaction already finished".into()))
    }
}

impl CacheTransaction for SqliteCacheTx<'_> {
    fn update(&mut self, data: &[u8], valid_until: OffsetDateTime) -> Result<usize, StoreError> {
        self.open()?
            .execute(
                "UPDATE hunting_task_list_cache SET data=?, valid_until_ms=?",
                params![data, to_ms(valid_until)],
            )
            .map_err(StoreError::backend)
    }

    fn insert(&mut self, data: &[u8], valid_until: OffsetDateTime) -> Result<(), StoreError> {
        self.open()?
            .execute(
                "INSERT INTO hunting_task_list_cache(data,valid_until_ms) VALUES (?,?)",
                params![data, to_ms(valid_until)],
            )
            .map_err(StoreError::backend)?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        // a failed commit drops the transaction, which rolls it back
        match self.tx.take() {
            Some(tx) => {
                tx.commit().map_err(StoreError::backend)?;
                debug!("hunting task list cache row written");
                Ok(())
            }
            None => Err(StoreError::Corrupt("cache transaction already finished".into())),
        }
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().map_err(StoreError::backend),
            None => Ok(()),
        }
    }
}

impl CacheStore for Db {
    type Tx<'a> = SqliteCacheTx<'a>;

    fn load_task_list_cache(&self) -> Result<Option<CachedTaskList>, StoreError> {
        let row: Option<(Vec<u8>, i64)> = self
            .conn
            .query_row(
                "SELECT data, valid_until_ms FROM hunting_task_list_cache LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(StoreError::backend)?;
        let Some((data, ms)) = row else {
            return Ok(None);
        };
        let valid_until = from_ms(ms).map_err(|e| {
            warn!(valid_until_ms = ms, "hunting task list cache row has an unusable expiry");
            e
        })?;
        Ok(Some(CachedTaskList { data, valid_until }))
    }

    fn begin(&self) -> Result<SqliteCacheTx<'_>, StoreError> {
        let tx = self.conn.unchecked_transaction().map_err(StoreError::backend)?;
        Ok(SqliteCacheTx { tx: Some(tx) })
    }
}
