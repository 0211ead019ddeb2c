//! Bounded background persistence of settings documents.
//!
//! Writes are queued on a bounded channel and applied by a single worker.
//! `enqueue` never waits: when the queue is full the write is dropped and
//! counted. Store failures are logged and counted, never surfaced to the
//! caller that produced the state.

use autopilot_core::{SettingsKey, SettingsStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum PersistJob {
    Write {
        user_id: String,
        key: SettingsKey,
        value: serde_json::Value,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceStats {
    pub enqueued: u64,
    pub persisted: u64,
    pub failed: u64,
    pub dropped: u64,
}

pub struct PersistenceQueue {
    tx: mpsc::Sender<PersistJob>,
    counters: Arc<Counters>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceQueue {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn SettingsStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run_worker(store, rx, counters.clone()));

        Self {
            tx,
            counters,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a document write. Returns false when the write was dropped.
    pub fn enqueue(&self, user_id: &str, key: SettingsKey, value: serde_json::Value) -> bool {
        let job = PersistJob::Write {
            user_id: user_id.to_string(),
            key,
            value,
        };
        match self.tx.try_send(job) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                warn!(user_id, key = %key, "Persistence queue full, dropping write");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                warn!(user_id, key = %key, "Persistence queue closed, dropping write");
                false
            }
        }
    }

    /// Serialize and queue a typed document.
    pub fn enqueue_typed<T: Serialize + ?Sized>(
        &self,
        user_id: &str,
        key: SettingsKey,
        value: &T,
    ) -> bool {
        match serde_json::to_value(value) {
            Ok(json) => self.enqueue(user_id, key, json),
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(user_id, key = %key, error = %e, "Failed to serialize settings document");
                false
            }
        }
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PersistJob::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            enqueued: self.counters.enqueued.load(Ordering::SeqCst),
            persisted: self.counters.persisted.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            dropped: self.counters.dropped.load(Ordering::SeqCst),
        }
    }

    /// Drain outstanding writes and stop the worker.
    pub async fn shutdown(&self) {
        self.flush().await;
        if let Some(worker) = self.worker.lock().await.take() {
            worker.abort();
        }
        info!(stats = ?self.stats(), "Persistence queue stopped");
    }
}

async fn run_worker(
    store: Arc<dyn SettingsStore>,
    mut rx: mpsc::Receiver<PersistJob>,
    counters: Arc<Counters>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            PersistJob::Write {
                user_id,
                key,
                value,
            } => match store.save(&user_id, key, value).await {
                Ok(()) => {
                    counters.persisted.fetch_add(1, Ordering::SeqCst);
                    debug!(user_id = %user_id, key = %key, "Settings persisted");
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    warn!(user_id = %user_id, key = %key, error = %e, "Failed to persist settings");
                }
            },
            PersistJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
