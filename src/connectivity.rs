//! Platform online/offline signal
//!
//! The queue and the stream manager never talk to each other. The host
//! feeds network availability into a `ConnectivityMonitor`; the queue
//! consults it to skip doomed writes, and `spawn_replay_on_reconnect`
//! turns every offline-to-online edge into a replay pass.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::queue::{OfflineWriteQueue, ReplayOutcome};

/// Shared online flag. Starts online unless told otherwise.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Record the platform's current state. Repeats are ignored.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            log::info!("Network is {}", if online { "online" } else { "offline" });
            *current = online;
            true
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Replay `queue` whenever `online` flips from false to true, and once at
/// start if the signal already reads online. A pass that is still running
/// absorbs further edges. The task ends when the signal's sender is dropped.
pub fn spawn_replay_on_reconnect(
    queue: Arc<OfflineWriteQueue>,
    mut online: watch::Receiver<bool>,
) -> JoinHandle<()> {
    // Baseline taken now, not at first poll, so an edge right after spawning
    // is still seen as an edge.
    let mut was_online = *online.borrow_and_update();
    tokio::spawn(async move {
        if was_online {
            spawn_replay(&queue);
        }
        while online.changed().await.is_ok() {
            let now_online = *online.borrow_and_update();
            let restored = now_online && !was_online;
            was_online = now_online;
            if restored {
                spawn_replay(&queue);
            }
        }
    })
}

fn spawn_replay(queue: &Arc<OfflineWriteQueue>) {
    if queue.is_empty() {
        return;
    }
    let queue = Arc::clone(queue);
    tokio::spawn(async move {
        match queue.replay_all().await {
            Ok(ReplayOutcome::Completed(report)) => log::debug!(
                "Reconnect replay: {} ok, {} failed",
                report.succeeded,
                report.failed
            ),
            Ok(ReplayOutcome::InProgress) => {
                log::debug!("Reconnect replay coalesced with running pass")
            }
            Err(e) => log::error!("Reconnect replay could not persist: {}", e),
        }
    });
}
