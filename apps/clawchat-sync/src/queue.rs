//! Durable FIFO of mutations recorded while the server was unreachable.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::{ApiRequest, ExecutorError, HttpMethod, RequestExecutor};
use crate::storage::{KeyValueStore, StorageError};

pub const QUEUE_STORAGE_KEY: &str = "cc-offline-queue";
pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: Uuid,
    pub method: HttpMethod,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl QueuedAction {
    /// The replay request, keyed by the entry id.
    pub fn to_request(&self) -> ApiRequest {
        let mut request =
            ApiRequest::new(self.method, self.path.clone()).with_idempotency_key(self.id.to_string());
        request.body = self.body.clone();
        request
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to encode queue: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Why a flush stopped before draining the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushHalt {
    /// The server rejected the credential; every remaining entry is kept.
    Unauthorized(ExecutorError),
    /// Replay of `id` failed; it and everything after it are kept.
    Failed { id: Uuid, error: ExecutorError },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub flushed: usize,
    pub attempted: usize,
    pub halted: Option<FlushHalt>,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.halted.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub capacity: usize,
    pub max_age: Duration,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

pub struct MutationQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    key: String,
    limits: QueueLimits,
    // Serializes every read-prune-write cycle. Never held across an await.
    cycle: Mutex<()>,
}

impl MutationQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            key: QUEUE_STORAGE_KEY.to_string(),
            limits: QueueLimits::default(),
            cycle: Mutex::new(()),
        }
    }

    pub fn with_limits(mut self, limits: QueueLimits) -> Self {
        self.limits = QueueLimits {
            capacity: limits.capacity.max(1),
            max_age: limits.max_age,
        };
        self
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    pub fn enqueue(
        &self,
        method: HttpMethod,
        path: impl Into<String>,
        body: Option<Value>,
    ) -> Result<QueuedAction, QueueError> {
        let _cycle = self.cycle.lock();
        let mut items = self.read_pruned()?;
        while items.len() >= self.limits.capacity {
            let evicted = items.remove(0);
            debug!(target: "clawchat::queue", id = %evicted.id, "evicting oldest queued action");
        }
        let action = QueuedAction {
            id: Uuid::new_v4(),
            method,
            path: path.into(),
            body,
            timestamp: self.clock.now(),
        };
        items.push(action.clone());
        self.write(&items)?;
        info!(
            target: "clawchat::queue",
            method = %action.method,
            path = %action.path,
            pending = items.len(),
            "queued offline mutation"
        );
        Ok(action)
    }

    /// Replays entries in FIFO order, removing each one as soon as it succeeds.
    /// Remote failures end the replay and are reported, never returned as errors.
    pub async fn flush(&self, executor: &dyn RequestExecutor) -> Result<FlushReport, QueueError> {
        let items = self.items()?;
        let mut report = FlushReport {
            attempted: items.len(),
            ..FlushReport::default()
        };
        if items.is_empty() {
            return Ok(report);
        }

        for item in &items {
            match executor.execute(item.to_request()).await {
                Ok(_) => {
                    self.remove(item.id)?;
                    report.flushed += 1;
                }
                Err(error) if error.is_authorization() => {
                    warn!(
                        target: "clawchat::queue",
                        error = %error,
                        "authorization rejected during flush; stopping"
                    );
                    report.halted = Some(FlushHalt::Unauthorized(error));
                    break;
                }
                Err(error) => {
                    warn!(
                        target: "clawchat::queue",
                        path = %item.path,
                        error = %error,
                        "flush failed; will retry later"
                    );
                    report.halted = Some(FlushHalt::Failed { id: item.id, error });
                    break;
                }
            }
        }

        info!(
            target: "clawchat::queue",
            flushed = report.flushed,
            attempted = report.attempted,
            "offline queue flushed"
        );
        Ok(report)
    }

    pub fn items(&self) -> Result<Vec<QueuedAction>, QueueError> {
        let _cycle = self.cycle.lock();
        self.read_pruned()
    }

    pub fn count(&self) -> Result<usize, QueueError> {
        Ok(self.items()?.len())
    }

    pub fn clear(&self) -> Result<(), QueueError> {
        let _cycle = self.cycle.lock();
        self.store.remove(&self.key)?;
        Ok(())
    }

    fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        let _cycle = self.cycle.lock();
        let mut items = self.read_raw()?;
        items.retain(|item| item.id != id);
        self.write(&items)
    }

    fn read_raw(&self) -> Result<Vec<QueuedAction>, QueueError> {
        let Some(raw) = self.store.get(&self.key)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(items) => Ok(items),
            Err(err) => {
                warn!(target: "clawchat::queue", error = %err, "discarding unreadable offline queue");
                Ok(Vec::new())
            }
        }
    }

    /// Reads the list without expired entries, persisting the pruned copy when
    /// anything expired. Callers hold `cycle`.
    fn read_pruned(&self) -> Result<Vec<QueuedAction>, QueueError> {
        let mut items = self.read_raw()?;
        let cutoff = self.clock.now() - self.limits.max_age;
        let before = items.len();
        items.retain(|item| item.timestamp > cutoff);
        if items.len() != before {
            debug!(
                target: "clawchat::queue",
                pruned = before - items.len(),
                "pruned stale queued actions"
            );
            self.write(&items)?;
        }
        Ok(items)
    }

    fn write(&self, items: &[QueuedAction]) -> Result<(), QueueError> {
        if items.is_empty() {
            self.store.remove(&self.key)?;
            return Ok(());
        }
        let encoded = serde_json::to_string(items)?;
        self.store.set(&self.key, &encoded)?;
        Ok(())
    }
}
