//! The durable layer behind the in-memory entries.
//!
//! Values are only read from a [`PersistentStore`] to seed the in-memory entries on a cold start,
//! and written to it after every successful fetch of a persistent key. All writes go through the
//! [`PersistWriter`] queue so that they never block a lookup.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::{mpsc, oneshot};

use super::KeyPattern;

mod fs;
mod memory;

pub use fs::FilesystemStore;
pub use memory::MemoryStore;

/// A durable key/value store the cache writes through to.
///
/// The store is expected to be consistent for single calls. The cache never spans a transaction
/// across the store and its in-memory entries.
#[async_trait]
pub trait PersistentStore: fmt::Debug + Send + Sync {
    /// Returns the stored bytes, or `None` if there is no valid record for `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value`, which is no longer returned by [`get`](Self::get) after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Deletes the record for `key`. Deleting a missing record is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Deletes all records.
    async fn clear(&self) -> Result<()>;

    /// Deletes all records whose key matches `pattern`, returning how many were deleted.
    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize>;
}

enum PersistOp {
    Store {
        key: String,
        value: Vec<u8>,
        ttl: Duration,
    },
    Delete {
        key: String,
    },
    DeleteMatching {
        pattern: KeyPattern,
    },
    Clear,
    /// Completes once every operation queued before it was applied.
    Flush,
}

impl PersistOp {
    fn as_tag(&self) -> &'static str {
        match self {
            PersistOp::Store { .. } => "store",
            PersistOp::Delete { .. } => "delete",
            PersistOp::DeleteMatching { .. } => "delete_matching",
            PersistOp::Clear => "clear",
            PersistOp::Flush => "flush",
        }
    }
}

struct PersistMessage {
    op: PersistOp,
    /// Receives the number of affected records once the operation was applied.
    done_tx: Option<oneshot::Sender<usize>>,
}

/// Applies writes to a [`PersistentStore`] in the background, in the order they were queued.
///
/// [`store`](Self::store) never waits: if the queue is full, the write is dropped. The other
/// operations wait for room in the queue and complete once they were applied, which keeps them
/// ordered after all stores queued before them.
#[derive(Debug, Clone)]
pub struct PersistWriter {
    queue_tx: mpsc::Sender<PersistMessage>,
}

impl PersistWriter {
    /// Spawns the worker applying writes to `store`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<dyn PersistentStore>, max_queue_size: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(max_queue_size.max(1));
        tokio::spawn(Self::worker(queue_rx, store).bind_hub(Hub::new_from_top(Hub::current())));
        Self { queue_tx }
    }

    /// Long running task applying queued writes one after another.
    ///
    /// Terminates once all writers were dropped.
    async fn worker(mut queue_rx: mpsc::Receiver<PersistMessage>, store: Arc<dyn PersistentStore>) {
        while let Some(PersistMessage { op, done_tx }) = queue_rx.recv().await {
            let tag = op.as_tag();
            let result = match op {
                PersistOp::Store { key, value, ttl } => store.set(&key, value, ttl).await.map(|_| 1),
                PersistOp::Delete { key } => store.delete(&key).await.map(|_| 1),
                PersistOp::DeleteMatching { pattern } => store.delete_matching(&pattern).await,
                PersistOp::Clear => store.clear().await.map(|_| 0),
                PersistOp::Flush => Ok(0),
            };

            let affected = match result {
                Ok(affected) => {
                    metric!(counter("caches.persistent.write") += 1, "op" => tag, "status" => "ok");
                    affected
                }
                Err(err) => {
                    metric!(counter("caches.persistent.write") += 1, "op" => tag, "status" => "error");
                    let dynerr: &dyn std::error::Error = err.as_ref();
                    tracing::error!(error = dynerr, op = tag, "Persistent store write failed");
                    0
                }
            };

            // The submitter may not care about completion.
            if let Some(done_tx) = done_tx {
                done_tx.send(affected).ok();
            }
        }
        tracing::debug!("Persistent store writer terminated");
    }

    /// Queues storing `value` for `key`, dropping it if the queue is full.
    pub fn store(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        metric!(gauge("caches.persistent.queue_capacity") = self.queue_tx.capacity() as u64);
        let message = PersistMessage {
            op: PersistOp::Store {
                key: key.to_owned(),
                value,
                ttl,
            },
            done_tx: None,
        };
        self.queue_tx.try_send(message).unwrap_or_else(|err| {
            metric!(counter("caches.persistent.store.dropped") += 1);
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::error!(key, "Persistent store queue full")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::error!(key, "Persistent store writer terminated")
                }
            }
        });
    }

    pub async fn delete(&self, key: &str) {
        self.submit(PersistOp::Delete {
            key: key.to_owned(),
        })
        .await;
    }

    pub async fn delete_matching(&self, pattern: KeyPattern) -> usize {
        self.submit(PersistOp::DeleteMatching { pattern }).await
    }

    pub async fn clear(&self) {
        self.submit(PersistOp::Clear).await;
    }

    /// Waits until all previously queued writes were applied.
    pub async fn flush(&self) {
        self.submit(PersistOp::Flush).await;
    }

    async fn submit(&self, op: PersistOp) -> usize {
        let (done_tx, done_rx) = oneshot::channel();
        let message = PersistMessage {
            op,
            done_tx: Some(done_tx),
        };
        if self.queue_tx.send(message).await.is_err() {
            tracing::error!("Persistent store writer terminated");
            return 0;
        }
        done_rx.await.unwrap_or_default()
    }
}
