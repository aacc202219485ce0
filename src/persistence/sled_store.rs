//! Durable message log backed by `sled`.
//!
//! Every queue gets its own tree, `queue/<name>`. Records are keyed by the
//! big-endian message id so iteration yields publish order, and each write is
//! flushed before the call returns: once `append` reports success the record
//! survives a crash, and once `mark_deleted` reports success it never comes
//! back on replay.
//!
//! Transient I/O failures are retried a bounded number of times with a linear
//! backoff before the error is surfaced. The backoff sleeps on the calling
//! thread, and callers reach this module with the broker lock held: while one
//! write is being retried every other broker call waits for it. Keep
//! `retry_backoff_ms` in the tens of milliseconds; each pause is also capped
//! at `MAX_BACKOFF`.

use std::thread;
use std::time::Duration;

#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, warn};

use crate::broker::message::DeadLetterInfo;
use crate::config::StorageSettings;
use crate::utils::error::PersistenceError;

type Result<T> = std::result::Result<T, PersistenceError>;

/// Upper bound for a single pause between retries.
pub const MAX_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: u64,
    pub body: Vec<u8>,
    pub delivery_count: u32,
    pub enqueued_at: i64,
    #[serde(default)]
    pub dead_letter: Option<DeadLetterInfo>,
}

/// How hard to try before a storage error is reported to the caller.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl From<&StorageSettings> for RetryPolicy {
    fn from(settings: &StorageSettings) -> Self {
        Self {
            attempts: settings.retry_attempts.max(1),
            backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }
}

/// Storage operations to let through, then to fail with an I/O error.
#[cfg(test)]
#[derive(Debug, Default)]
struct Faults {
    pass: AtomicU32,
    fail: AtomicU32,
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
    retry: RetryPolicy,
    #[cfg(test)]
    faults: Arc<Faults>,
}

impl Persistence {
    fn with_db(db: Db, retry: RetryPolicy) -> Self {
        Self {
            db,
            retry,
            #[cfg(test)]
            faults: Arc::default(),
        }
    }

    /// Open or create a sled database at `path`.
    pub fn open(path: &str, retry: RetryPolicy) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self::with_db(db, retry))
    }

    /// A database that lives in a temporary directory and is removed on drop.
    pub fn temporary() -> Result<Self> {
        Self::temporary_with(RetryPolicy::default())
    }

    pub fn temporary_with(retry: RetryPolicy) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::with_db(db, retry))
    }

    /// Let the next `pass` storage operations through, then fail the `fail`
    /// after them with an I/O error. Every retry attempt counts as one
    /// operation. Shared by all clones of this handle.
    #[cfg(test)]
    pub(crate) fn inject_faults(&self, pass: u32, fail: u32) {
        self.faults.pass.store(pass, Ordering::SeqCst);
        self.faults.fail.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_fault(&self) -> Option<sled::Error> {
        if self.faults.fail.load(Ordering::SeqCst) == 0 {
            return None;
        }
        let take = |n: u32| n.checked_sub(1);
        if self.faults.pass.fetch_update(Ordering::SeqCst, Ordering::SeqCst, take).is_ok() {
            return None;
        }
        self.faults
            .fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, take)
            .ok()
            .map(|_| sled::Error::Io(std::io::Error::other("injected storage fault")))
    }

    #[cfg(not(test))]
    fn injected_fault(&self) -> Option<sled::Error> {
        None
    }

    /// Next message id. Ids are monotonic across all queues and restarts.
    pub fn next_id(&self) -> Result<u64> {
        self.with_retry("generate_id", || self.db.generate_id())
    }

    /// Write a record and flush it before returning.
    pub fn append(&self, queue: &str, message: &StoredMessage) -> Result<()> {
        let tree = self.tree(queue)?;
        let value = serde_json::to_vec(message)?;
        self.with_retry("append", || {
            tree.insert(message.id.to_be_bytes(), value.clone())?;
            tree.flush()
        })?;
        debug!(queue, id = message.id, "appended message to durable log");
        Ok(())
    }

    /// Overwrite an existing record, for example after a delivery count change.
    pub fn update(&self, queue: &str, message: &StoredMessage) -> Result<()> {
        self.append(queue, message)
    }

    /// Remove a record and flush the removal before returning.
    pub fn mark_deleted(&self, queue: &str, id: u64) -> Result<()> {
        let tree = self.tree(queue)?;
        self.with_retry("mark_deleted", || {
            tree.remove(id.to_be_bytes())?;
            tree.flush()
        })?;
        debug!(queue, id, "removed message from durable log");
        Ok(())
    }

    /// Replay the log of `queue` starting at message id `offset`, in id order.
    pub fn read_from(&self, queue: &str, offset: u64) -> Result<Vec<StoredMessage>> {
        let tree = self.tree(queue)?;
        let mut messages = Vec::new();
        for entry in tree.range(offset.to_be_bytes()..) {
            let (key, value) = entry?;
            match serde_json::from_slice::<StoredMessage>(&value) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(queue, key = ?key, "skipping unreadable record: {e}"),
            }
        }
        Ok(messages)
    }

    /// Number of records currently held for `queue`.
    pub fn len(&self, queue: &str) -> Result<usize> {
        Ok(self.tree(queue)?.len())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn tree(&self, queue: &str) -> Result<Tree> {
        let name = format!("queue/{queue}");
        self.with_retry("open_tree", || self.db.open_tree(&name))
    }

    fn with_retry<T>(&self, operation: &str, mut op: impl FnMut() -> sled::Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            let result = match self.injected_fault() {
                Some(fault) => Err(fault),
                None => op(),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(sled::Error::Io(e)) if attempt < self.retry.attempts => {
                    warn!(operation, attempt, "transient storage error, retrying: {e}");
                    thread::sleep((self.retry.backoff * attempt).min(MAX_BACKOFF));
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .field("retry", &self.retry)
            .finish()
    }
}
