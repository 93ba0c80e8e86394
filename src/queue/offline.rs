//! Durable FIFO of deferred writes

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::storage::KeyValueStore;

use super::{Method, QueueError, QueuedOperation, RequestClient};

/// Tally of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Failed items put back on the queue (only with `retain_failed`).
    pub requeued: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Completed(ReplayReport),
    /// Another pass was already running; this request was coalesced.
    InProgress,
}

impl ReplayOutcome {
    pub fn report(&self) -> Option<&ReplayReport> {
        match self {
            ReplayOutcome::Completed(report) => Some(report),
            ReplayOutcome::InProgress => None,
        }
    }
}

/// Clears the replay flag however the pass ends.
struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sends writes, deferring the ones that fail for lack of connectivity.
///
/// Every change to the queue is written to the backing store before the
/// in-memory list is updated, so a `Queued` error always means the write
/// is on disk. Replay is single-flight and strictly sequential.
pub struct OfflineWriteQueue {
    client: Arc<dyn RequestClient>,
    store: Arc<dyn KeyValueStore>,
    storage_key: String,
    retain_failed: bool,
    items: Mutex<Vec<QueuedOperation>>,
    replaying: AtomicBool,
    online: Option<watch::Receiver<bool>>,
    pending_tx: watch::Sender<usize>,
}

impl OfflineWriteQueue {
    /// Open the queue, restoring anything persisted by an earlier run.
    pub fn new(
        client: Arc<dyn RequestClient>,
        store: Arc<dyn KeyValueStore>,
        config: &QueueConfig,
    ) -> Result<Self, QueueError> {
        let items: Vec<QueuedOperation> = match store.get(&config.storage_key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| QueueError::Serialization(e.to_string()))?,
            None => Vec::new(),
        };
        if !items.is_empty() {
            log::info!("Restored {} queued writes", items.len());
        }
        let (pending_tx, _) = watch::channel(items.len());

        Ok(Self {
            client,
            store,
            storage_key: config.storage_key.clone(),
            retain_failed: config.retain_failed,
            items: Mutex::new(items),
            replaying: AtomicBool::new(false),
            online: None,
            pending_tx,
        })
    }

    /// Attach an online/offline signal. While it reports offline, writes
    /// are queued without touching the network.
    pub fn with_connectivity(mut self, online: watch::Receiver<bool>) -> Self {
        self.online = Some(online);
        self
    }

    /// Perform a request, or queue it if it is a write that cannot reach
    /// the server. Returns `QueueError::Queued` in that case.
    pub async fn send(
        &self,
        endpoint: &str,
        method: Method,
        payload: Option<Value>,
    ) -> Result<Value, QueueError> {
        if method.is_mutating() && self.is_offline() {
            log::debug!("Offline, queueing {} {}", method, endpoint);
            let id = self.enqueue(endpoint, method, payload)?;
            return Err(QueueError::Queued { id });
        }

        match self.client.request(endpoint, method, payload.as_ref()).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_connectivity() && method.is_mutating() => {
                log::info!("{} {} deferred: {}", method, endpoint, e);
                let id = self.enqueue(endpoint, method, payload)?;
                Err(QueueError::Queued { id })
            }
            Err(e) => Err(QueueError::Request(e)),
        }
    }

    /// Durably append a write without attempting it.
    pub fn enqueue(
        &self,
        endpoint: &str,
        method: Method,
        payload: Option<Value>,
    ) -> Result<Uuid, QueueError> {
        let op = QueuedOperation::new(endpoint, method, payload);
        let id = op.id;
        self.mutate(|items| {
            items.push(op);
            Ok(())
        })?;
        Ok(id)
    }

    /// Replay every queued write in order, one at a time.
    ///
    /// Only the items present when the pass starts are attempted and then
    /// removed; writes queued during the pass wait for the next one.
    pub async fn replay_all(&self) -> Result<ReplayOutcome, QueueError> {
        if self
            .replaying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Replay already in progress");
            return Ok(ReplayOutcome::InProgress);
        }
        let _guard = ReplayGuard(&self.replaying);

        let batch = self.pending();
        if batch.is_empty() {
            return Ok(ReplayOutcome::Completed(ReplayReport::default()));
        }
        log::info!("Replaying {} queued writes", batch.len());

        let mut report = ReplayReport::default();
        let mut failed = Vec::new();
        for op in &batch {
            match self
                .client
                .request(&op.endpoint, op.method, op.payload.as_ref())
                .await
            {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    log::warn!("Replay of {} {} ({}) failed: {}", op.method, op.endpoint, op.id, e);
                    report.failed += 1;
                    failed.push(op.clone());
                }
            }
        }

        let attempted: HashSet<Uuid> = batch.iter().map(|op| op.id).collect();
        let retained = if self.retain_failed { failed } else { Vec::new() };
        report.requeued = retained.len();
        self.mutate(move |items| {
            let newer = items.drain(..).filter(|op| !attempted.contains(&op.id));
            let rebuilt: Vec<QueuedOperation> = retained.into_iter().chain(newer).collect();
            *items = rebuilt;
            Ok(())
        })?;

        log::info!(
            "Replay finished: {} succeeded, {} failed",
            report.succeeded,
            report.failed
        );
        Ok(ReplayOutcome::Completed(report))
    }

    /// Drop one queued write. Returns whether it was present.
    pub fn discard(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut found = false;
        self.mutate(|items| {
            let before = items.len();
            items.retain(|op| op.id != id);
            found = items.len() != before;
            Ok(())
        })?;
        Ok(found)
    }

    /// Snapshot of the queue, oldest first.
    pub fn pending(&self) -> Vec<QueuedOperation> {
        self.lock_items().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::Acquire)
    }

    /// Follow the number of queued writes.
    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    fn is_offline(&self) -> bool {
        self.online.as_ref().is_some_and(|rx| !*rx.borrow())
    }

    fn lock_items(&self) -> MutexGuard<'_, Vec<QueuedOperation>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change` to a copy, persist it, then commit. A failed write
    /// leaves both the store and the in-memory list untouched.
    fn mutate<F>(&self, change: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut Vec<QueuedOperation>) -> Result<(), QueueError>,
    {
        let mut items = self.lock_items();
        let mut next = items.clone();
        change(&mut next)?;

        if next.is_empty() {
            self.store.remove(&self.storage_key)?;
        } else {
            let raw = serde_json::to_string(&next)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            self.store.set(&self.storage_key, &raw)?;
        }
        *items = next;
        let len = items.len();
        drop(items);

        self.pending_tx.send_if_modified(|current| {
            if *current == len {
                return false;
            }
            *current = len;
            true
        });
        Ok(())
    }
}
