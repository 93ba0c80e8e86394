//! SentimentStore - reactive region → score map
//!
//! Only the stream sync driver writes to the store. Everyone else reads
//! cloned snapshots or subscribes; nobody gets a mutable view. Each
//! mutation notifies observers exactly once, both through registered
//! callbacks and through a broadcast channel.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::message::{clamp_score, RegionDelta};

/// Default number of deltas kept for recent-activity display.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Point-in-time copy of the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentimentSnapshot {
    pub sentiments: BTreeMap<String, f64>,
    pub sample_counts: BTreeMap<String, u64>,
    pub last_update: Option<RegionDelta>,
    /// Number of deltas applied since startup. Never decreases.
    pub update_count: u64,
}

/// What changed.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Replaced { regions: usize },
    Region(RegionDelta),
}

type Callback = Arc<dyn Fn(&SentimentSnapshot) + Send + Sync>;

#[derive(Default)]
struct Inner {
    snapshot: SentimentSnapshot,
    history: VecDeque<RegionDelta>,
}

/// Shared handle; clones observe the same map.
#[derive(Clone)]
pub struct SentimentStore {
    inner: Arc<Mutex<Inner>>,
    subscribers: Arc<Mutex<HashMap<Uuid, Callback>>>,
    change_tx: broadcast::Sender<StoreChange>,
    history_limit: usize,
}

impl SentimentStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        let (change_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            change_tx,
            history_limit,
        }
    }

    /// Clone of the current contents.
    pub fn snapshot(&self) -> SentimentSnapshot {
        self.inner
            .lock()
            .map(|inner| inner.snapshot.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, region: &str) -> Option<f64> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.snapshot.sentiments.get(region).copied())
    }

    pub fn sample_count(&self, region: &str) -> Option<u64> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.snapshot.sample_counts.get(region).copied())
    }

    pub fn update_count(&self) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.snapshot.update_count)
            .unwrap_or(0)
    }

    pub fn last_update(&self) -> Option<RegionDelta> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.snapshot.last_update.clone())
    }

    /// Recent deltas, oldest first.
    pub fn history(&self) -> Vec<RegionDelta> {
        self.inner
            .lock()
            .map(|inner| inner.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the whole map in one assignment. Sample counts for regions
    /// that are no longer present are dropped.
    pub(crate) fn replace_all(&self, mapping: BTreeMap<String, f64>) {
        let regions = mapping.len();
        let snapshot = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let sentiments: BTreeMap<String, f64> = mapping
                .into_iter()
                .map(|(region, score)| (region, clamp_score(score)))
                .collect();
            inner
                .snapshot
                .sample_counts
                .retain(|region, _| sentiments.contains_key(region));
            inner.snapshot.sentiments = sentiments;
            inner.snapshot.clone()
        };
        self.notify(&snapshot, StoreChange::Replaced { regions });
    }

    /// Replace one region's entry and record the delta.
    pub(crate) fn apply_delta(&self, mut delta: RegionDelta) {
        delta.average = clamp_score(delta.average);
        let snapshot = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner
                .snapshot
                .sentiments
                .insert(delta.region.clone(), delta.average);
            inner
                .snapshot
                .sample_counts
                .insert(delta.region.clone(), delta.sample_count);
            inner.snapshot.update_count += 1;
            inner.snapshot.last_update = Some(delta.clone());

            if self.history_limit > 0 {
                inner.history.push_back(delta.clone());
                while inner.history.len() > self.history_limit {
                    inner.history.pop_front();
                }
            }
            inner.snapshot.clone()
        };
        self.notify(&snapshot, StoreChange::Region(delta));
    }

    /// Register a callback invoked with every new snapshot.
    pub fn on_change(&self, callback: Box<dyn Fn(&SentimentSnapshot) + Send + Sync>) -> Uuid {
        let id = Uuid::new_v4();
        self.lock_subscribers().insert(id, Arc::from(callback));
        id
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.lock_subscribers().remove(&id);
    }

    /// Receive a `StoreChange` per mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.change_tx.subscribe()
    }

    fn notify(&self, snapshot: &SentimentSnapshot, change: StoreChange) {
        let _ = self.change_tx.send(change);
        // Callbacks may subscribe or unsubscribe, so never call them under the lock
        let callbacks: Vec<Callback> = self.lock_subscribers().values().cloned().collect();
        for callback in callbacks {
            callback(snapshot);
        }
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, HashMap<Uuid, Callback>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SentimentStore {
    fn default() -> Self {
        Self::new()
    }
}
