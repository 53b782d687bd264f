//! PersistentQueue — a crash-safe FIFO of pending file operations.
//!
//! `Mutex<VecDeque<QueueItem>>`-backed, single-producer (the watcher)
//! single-consumer (the processor), snapshotting to a JSON state file via
//! atomic temp+rename after every mutating call (the same discipline
//! `util::atomic_write` already gives `Rewrapper` and `Envelope`). On
//! construction, an existing state file is restored verbatim; anything left
//! in `processing` (a crash mid-attempt) resets to `pending` so a restart
//! can't deadlock on an item nobody will ever finish.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::atomic_write;

/// `-1` as stored in configuration means unbounded retries; represented
/// internally as `None` so the requeue path never has to special-case a
/// sentinel integer.
pub const UNBOUNDED_RETRIES: i64 = -1;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Encrypt,
    Decrypt,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Failed,
    Completed,
    Dead,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub operation: Operation,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub key_path: PathBuf,
    pub checksum_path: Option<PathBuf>,
    pub source_size: u64,
    pub status: Status,
    pub attempts: u32,
    /// Unix seconds. An item is dequeue-eligible once this has passed.
    pub next_eligible: u64,
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(
        id: impl Into<String>,
        operation: Operation,
        source_path: PathBuf,
        dest_path: PathBuf,
        key_path: PathBuf,
        checksum_path: Option<PathBuf>,
        source_size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            operation,
            source_path,
            dest_path,
            key_path,
            checksum_path,
            source_size,
            status: Status::Pending,
            attempts: 0,
            next_eligible: now_secs(),
            last_error: None,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Serialize, Deserialize)]
struct QueueState {
    schema: u32,
    items: Vec<QueueItem>,
    dead: Vec<QueueItem>,
}

const SCHEMA_VERSION: u32 = 1;

struct Inner {
    items: VecDeque<QueueItem>,
    dead: Vec<QueueItem>,
}

/// Outcome of a [`PersistentQueue::requeue`] call, telling the caller
/// whether the source file needs to be relocated to the dead-letter
/// directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Re-appended to the tail with an incremented attempt count and a
    /// backed-off `next_eligible`.
    Requeued,
    /// Exceeded the retry cap; moved to `dead` and out of FIFO order. The
    /// caller must relocate the source file to the dead-letter directory.
    DeadLettered,
}

pub struct PersistentQueue {
    inner: Mutex<Inner>,
    state_path: PathBuf,
    max_retries: i64,
    base_delay: Duration,
    max_delay: Duration,
}

impl PersistentQueue {
    /// Open (restoring from `state_path` if it exists) or create a fresh
    /// queue. Corruption (unreadable file, schema mismatch) fails
    /// construction rather than silently discarding items.
    pub fn open(
        state_path: impl Into<PathBuf>,
        max_retries: i64,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self> {
        let state_path = state_path.into();
        let inner = if state_path.exists() {
            Self::restore(&state_path)?
        } else {
            Inner { items: VecDeque::new(), dead: Vec::new() }
        };
        Ok(Self {
            inner: Mutex::new(inner),
            state_path,
            max_retries,
            base_delay,
            max_delay,
        })
    }

    fn restore(state_path: &Path) -> Result<Inner> {
        let raw = std::fs::read_to_string(state_path).map_err(|e| Error::io(state_path, e))?;
        let state: QueueState = serde_json::from_str(&raw)
            .map_err(|e| Error::Format(format!("queue state {}: {e}", state_path.display())))?;
        if state.schema != SCHEMA_VERSION {
            return Err(Error::Format(format!(
                "queue state schema {} unsupported (expected {SCHEMA_VERSION})",
                state.schema
            )));
        }
        // An item frozen mid-attempt (processing) or already marked failed
        // by a prior crash restores as pending: the processor that owned it
        // is gone, and the spec forbids deadlocking on it forever.
        let items = state
            .items
            .into_iter()
            .map(|mut item| {
                if item.status == Status::Processing {
                    item.status = Status::Pending;
                }
                item
            })
            .collect();
        Ok(Inner { items, dead: state.dead })
    }

    fn snapshot_locked(&self, inner: &Inner) -> Result<()> {
        let state = QueueState {
            schema: SCHEMA_VERSION,
            items: inner.items.iter().cloned().collect(),
            dead: inner.dead.clone(),
        };
        let json = serde_json::to_vec_pretty(&state)
            .map_err(|e| Error::Format(format!("serializing queue state: {e}")))?;
        atomic_write(&self.state_path, &json)
    }

    /// Append a new item to the tail of the FIFO.
    pub fn enqueue(&self, item: QueueItem) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.items.push_back(item);
        self.snapshot_locked(&inner)
    }

    /// Pop the oldest pending-or-failed item whose `next_eligible` has
    /// passed, marking it `processing` and removing it from the FIFO.
    /// Non-blocking: returns `None` on an empty or all-ineligible queue.
    pub fn dequeue(&self) -> Result<Option<QueueItem>> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_secs();
        let idx = inner.items.iter().position(|it| {
            matches!(it.status, Status::Pending | Status::Failed) && it.next_eligible <= now
        });
        let Some(idx) = idx else { return Ok(None) };
        let mut item = inner.items.remove(idx).unwrap();
        item.status = Status::Processing;
        let taken = item.clone();
        self.snapshot_locked(&inner)?;
        drop(inner);
        Ok(Some(taken))
    }

    /// Mark `item` completed and drop it from the queue's bookkeeping
    /// entirely (it is no longer pending, failed, processing or dead).
    pub fn complete(&self, _item: &QueueItem) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        self.snapshot_locked(&inner)
    }

    /// Record a processing failure for `item`. Bumps the attempt count; if
    /// still under the retry cap, re-appends to the tail with an
    /// exponentially backed-off `next_eligible`. Otherwise transitions the
    /// item to `dead` and returns [`RequeueOutcome::DeadLettered`] so the
    /// caller relocates the source file.
    pub fn requeue(&self, mut item: QueueItem, err: &Error) -> Result<RequeueOutcome> {
        item.attempts += 1;
        item.last_error = Some(err.to_string());

        let unbounded = self.max_retries == UNBOUNDED_RETRIES;
        if !unbounded && item.attempts as i64 >= self.max_retries {
            item.status = Status::Dead;
            let mut inner = self.inner.lock().unwrap();
            inner.dead.push(item);
            self.snapshot_locked(&inner)?;
            return Ok(RequeueOutcome::DeadLettered);
        }

        item.status = Status::Failed;
        let backoff_exp = item.attempts.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << backoff_exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        item.next_eligible = now_secs() + delay.as_secs().max(1);

        let mut inner = self.inner.lock().unwrap();
        inner.items.push_back(item);
        self.snapshot_locked(&inner)?;
        Ok(RequeueOutcome::Requeued)
    }

    /// Transition `item` straight to `dead` without consulting the retry
    /// cap, for error kinds that will not get better with time (a malformed
    /// header, an out-of-bounds chunk size). The attempt count is still
    /// bumped so the `QueueItem` invariant (strictly monotone) holds.
    pub fn dead_letter(&self, mut item: QueueItem, err: &Error) -> Result<()> {
        item.attempts += 1;
        item.last_error = Some(err.to_string());
        item.status = Status::Dead;
        let mut inner = self.inner.lock().unwrap();
        inner.dead.push(item);
        self.snapshot_locked(&inner)
    }

    /// Number of items currently pending or failed (eligible or not).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_count(&self) -> usize {
        self.inner.lock().unwrap().dead.len()
    }

    /// Snapshot the FIFO order, for tests that need to assert restore
    /// fidelity without going through dequeue.
    pub fn snapshot_items(&self) -> Vec<QueueItem> {
        self.inner.lock().unwrap().items.iter().cloned().collect()
    }
}
