//! Batching of server messages into one response body, and the cached
//! hunting task list built on top of it.

use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::clock::{checked_after, Clock};
use crate::codec::EncodeError;
use crate::message::Message;
use crate::store::{CacheStore, CacheTransaction, StoreError, TaskStore};

/// Update-or-insert attempts before a cache write gives up.
pub const CACHE_WRITE_ATTEMPTS: usize = 2;

#[derive(Debug, Error)]
pub enum TaskListError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cache validity of {0:?} runs past the representable time range")]
    ValidityOutOfRange(Duration),
}

/// Messages waiting to be encoded, followed by bytes that already are
/// (typically loaded from a cache).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageList {
    messages: Vec<Message>,
    encoded: Vec<u8>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn add_encoded(&mut self, bytes: &[u8]) {
        self.encoded.extend_from_slice(bytes);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// All pending messages in insertion order, then the pre-encoded bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        for message in &self.messages {
            out.extend(message.encode()?);
        }
        out.extend_from_slice(&self.encoded);
        Ok(out)
    }
}

/// The list of all active hunting tasks, served from the cache row while it
/// is valid and rebuilt (and re-cached for `validity`) once it is not.
pub fn get_current_hunting_task_list<S>(validity: Duration, store: &S, clock: &dyn Clock) -> Result<MessageList, TaskListError>
where
    S: TaskStore + CacheStore + ?Sized,
{
    let now = clock.now();
    let mut list = MessageList::new();
    if let Some(cached) = store.load_task_list_cache()? {
        if cached.valid_until > now {
            debug!(bytes = cached.data.len(), "hunting task list served from cache");
            list.add_encoded(&cached.data);
            return Ok(list);
        }
    }

    let valid_until = checked_after(now, validity).ok_or(TaskListError::ValidityOutOfRange(validity))?;
    let tasks = store.list_active_tasks()?;
    debug!(tasks = tasks.len(), "rebuilding hunting task list");
    for task in tasks {
        list.add(Message::HuntingTask(task));
    }
    let bytes = list.to_bytes()?;
    store_task_list_cache(store, &bytes, valid_until)?;
    Ok(list)
}

/// Write the cache row: UPDATE, INSERT if nothing was updated, COMMIT. A
/// failed attempt is rolled back and the whole sequence retried once; a
/// concurrent writer inserting the row between our UPDATE and INSERT is the
/// expected cause.
pub fn store_task_list_cache<S>(store: &S, data: &[u8], valid_until: OffsetDateTime) -> Result<(), StoreError>
where
    S: CacheStore + ?Sized,
{
    let mut attempt = 1;
    loop {
        let err = match store.begin() {
            Ok(mut tx) => match upsert(&mut tx, data, valid_until) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if let Err(rollback) = tx.rollback() {
                        warn!(error = %rollback, "rollback of hunting task list cache write failed");
                    }
                    e
                }
            },
            Err(e) => e,
        };
        if attempt == CACHE_WRITE_ATTEMPTS {
            return Err(err);
        }
        warn!(attempt, error = %err, "hunting task list cache write failed, retrying");
        attempt += 1;
    }
}

fn upsert<T: CacheTransaction>(tx: &mut T, data: &[u8], valid_until: OffsetDateTime) -> Result<(), StoreError> {
    if tx.update(data, valid_until)? == 0 {
        tx.insert(data, valid_until)?;
    }
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    use crate::clock::FixedClock;
    use crate::codec::split_messages;
    use crate::message::{CurrentServerTime, HuntingTask, PublicIpNotification};
    use crate::store::{CachedTaskList, TaskRecord, TaskTarget};

    const NOW: i64 = 1_700_000_000;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(NOW).unwrap()
    }

    fn task(id: u32) -> HuntingTask {
        HuntingTask {
            task_id: id,
            known_cert_hashes: vec![[id as u8; 32]],
            target: TaskTarget { host: format!("host{id}.example.org"), port: 443, ip: "203.0.113.9".parse().unwrap() },
        }
    }

    /// Cache store whose commits fail a configurable number of times.
    #[derive(Default)]
    struct MockCache {
        row: RefCell<Option<CachedTaskList>>,
        tasks: Vec<HuntingTask>,
        task_queries: Cell<usize>,
        commit_failures: Cell<usize>,
        begins: Cell<usize>,
        rollbacks: Cell<usize>,
    }

    struct MockTx<'a> {
        cache: &'a MockCache,
        pending: Option<CachedTaskList>,
    }

    impl CacheTransaction for MockTx<'_> {
        fn update(&mut self, data: &[u8], valid_until: OffsetDateTime) -> Result<usize, StoreError> {
            if self.cache.row.borrow().is_none() {
                return Ok(0);
            }
            self.pending = Some(CachedTaskList { data: data.to_vec(), valid_until });
            Ok(1)
        }

        fn insert(&mut self, data: &[u8], valid_until: OffsetDateTime) -> Result<(), StoreError> {
            self.pending = Some(CachedTaskList { data: data.to_vec(), valid_until });
            Ok(())
        }

        fn commit(&mut self) -> Result<(), StoreError> {
            if self.cache.commit_failures.get() > 0 {
                self.cache.commit_failures.set(self.cache.commit_failures.get() - 1);
                return Err(StoreError::Corrupt("row inserted concurrently".into()));
            }
            *self.cache.row.borrow_mut() = self.pending.take();
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), StoreError> {
            self.cache.rollbacks.set(self.cache.rollbacks.get() + 1);
            self.pending = None;
            Ok(())
        }
    }

    impl CacheStore for MockCache {
        type Tx<'a> = MockTx<'a>;

        fn load_task_list_cache(&self) -> Result<Option<CachedTaskList>, StoreError> {
            Ok(self.row.borrow().clone())
        }

        fn begin(&self) -> Result<MockTx<'_>, StoreError> {
            self.begins.set(self.begins.get() + 1);
            Ok(MockTx { cache: self, pending: None })
        }
    }

    impl TaskStore for MockCache {
        fn lookup_task(&self, _task_id: u32) -> Result<Option<TaskRecord>, StoreError> {
            Ok(None)
        }

        fn list_active_tasks(&self) -> Result<Vec<HuntingTask>, StoreError> {
            self.task_queries.set(self.task_queries.get() + 1);
            Ok(self.tasks.clone())
        }
    }

    #[test]
    fn ordering_of_pending_and_encoded() {
        let a = Message::CurrentServerTime(CurrentServerTime { now: now() });
        let b = Message::PublicIpNotification(PublicIpNotification::issue(b"k", "192.0.2.4".parse().unwrap()));
        let mut list = MessageList::new();
        list.add(a.clone());
        list.add_encoded(b"xx");
        list.add(b.clone());
        list.add_encoded(b"yyy");
        let mut expected = a.encode().unwrap();
        expected.extend(b.encode().unwrap());
        expected.extend_from_slice(b"xxyyy");
        assert_eq!(list.to_bytes().unwrap(), expected);
    }

    #[test]
    fn one_bad_message_fails_the_list() {
        let mut list = MessageList::new();
        list.add(Message::CurrentServerTime(CurrentServerTime { now: now() }));
        list.add(Message::CurrentServerTime(CurrentServerTime { now: OffsetDateTime::UNIX_EPOCH - time::Duration::seconds(5) }));
        assert!(list.to_bytes().is_err());
        assert!(MessageList::new().to_bytes().unwrap().is_empty());
    }

    #[test]
    fn cache_hit_skips_task_store() {
        let cache = MockCache {
            row: RefCell::new(Some(CachedTaskList { data: b"cached".to_vec(), valid_until: now() + time::Duration::seconds(1) })),
            tasks: vec![task(1)],
            ..Default::default()
        };
        let list = get_current_hunting_task_list(Duration::from_secs(60), &cache, &FixedClock(now())).unwrap();
        assert_eq!(list.to_bytes().unwrap(), b"cached");
        assert_eq!(cache.task_queries.get(), 0);
        assert_eq!(cache.begins.get(), 0);
    }

    #[test]
    fn missing_row_is_built_and_inserted() {
        let cache = MockCache { tasks: vec![task(1), task(2)], ..Default::default() };
        let list = get_current_hunting_task_list(Duration::from_secs(600), &cache, &FixedClock(now())).unwrap();
        let bytes = list.to_bytes().unwrap();
        assert_eq!(list.messages().len(), 2);
        assert_eq!(cache.task_queries.get(), 1);
        let row = cache.row.borrow().clone().unwrap();
        assert_eq!(row.data, bytes);
        assert_eq!(row.valid_until, now() + time::Duration::seconds(600));
        assert_eq!(split_messages(&bytes).unwrap().len(), 2);
    }

    #[test]
    fn expired_row_is_refreshed() {
        let cache = MockCache {
            row: RefCell::new(Some(CachedTaskList { data: b"stale".to_vec(), valid_until: now() })),
            tasks: vec![task(3)],
            ..Default::default()
        };
        let list = get_current_hunting_task_list(Duration::from_secs(60), &cache, &FixedClock(now())).unwrap();
        assert_eq!(cache.task_queries.get(), 1);
        let row = cache.row.borrow().clone().unwrap();
        assert_eq!(row.data, list.to_bytes().unwrap());
        assert_ne!(row.data, b"stale");
    }

    #[test]
    fn oversized_validity_is_an_error() {
        let cache = MockCache { tasks: vec![task(1)], ..Default::default() };
        let err = get_current_hunting_task_list(Duration::from_secs(10_u64.pow(13)), &cache, &FixedClock(now())).unwrap_err();
        assert!(matches!(err, TaskListError::ValidityOutOfRange(_)));
        assert_eq!(cache.begins.get(), 0);
        assert!(cache.row.borrow().is_none());
    }

    #[test]
    fn commit_failure_retried_once() {
        let cache = MockCache { commit_failures: Cell::new(1), ..Default::default() };
        store_task_list_cache(&cache, b"data", now()).unwrap();
        assert_eq!(cache.begins.get(), 2);
        assert_eq!(cache.rollbacks.get(), 1);
        assert_eq!(cache.row.borrow().as_ref().unwrap().data, b"data");
    }

    #[test]
    fn second_commit_failure_propagates() {
        let cache = MockCache { commit_failures: Cell::new(2), ..Default::default() };
        let err = store_task_list_cache(&cache, b"data", now()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
        assert_eq!(cache.begins.get(), 2);
        assert_eq!(cache.rollbacks.get(), 2);
        assert!(cache.row.borrow().is_none());
    }

    #[test]
    fn refresh_surfaces_cache_write_failure() {
        let cache = MockCache { tasks: vec![task(1)], commit_failures: Cell::new(2), ..Default::default() };
        let err = get_current_hunting_task_list(Duration::from_secs(60), &cache, &FixedClock(now())).unwrap_err();
        assert!(matches!(err, TaskListError::Store(_)));
    }
}
