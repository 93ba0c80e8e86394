//! StreamSyncManager against the in-process channel simulator
//!
//! Every test runs on a paused tokio clock, so reconnect delays and
//! keepalive intervals elapse instantly but in a deterministic order.
//!
//! Run with:
//!   cargo test --test sync_manager

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{broadcast, Notify};

use voxsync::channel::simulated::{OpenOutcome, SentFrame, SimConnector, SimPeer};
use voxsync::channel::{ChannelConnector, ChannelError, ChannelEvent, MessageChannel};
use voxsync::sync::StoreChange;
use voxsync::{ConnectionState, StreamConfig, StreamSyncManager};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn stream_config() -> StreamConfig {
    StreamConfig {
        url: "ws://sim.test/ws/sentiment".to_string(),
        reconnect_interval_ms: 3000,
        max_reconnect_attempts: 3,
        keepalive_interval_ms: 30_000,
        ..StreamConfig::default()
    }
}

async fn connected(config: &StreamConfig) -> (StreamSyncManager, Arc<SimConnector>, SimPeer) {
    let connector = SimConnector::new();
    let manager = StreamSyncManager::new(config, connector.clone()).unwrap();
    manager.connect();
    let peer = connector.next_peer().await.unwrap();
    manager.wait_for(|s| s.is_connected()).await;
    (manager, connector, peer)
}

async fn next_change(changes: &mut broadcast::Receiver<StoreChange>) -> StoreChange {
    tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no store change arrived")
        .unwrap()
}

/// Holds every open until released, to model a slow handshake.
struct GatedConnector {
    inner: Arc<SimConnector>,
    gate: Arc<Notify>,
}

#[async_trait]
impl ChannelConnector for GatedConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn MessageChannel>, ChannelError> {
        self.gate.notified().await;
        self.inner.open(url).await
    }
}

/// Channels that can receive but never send.
struct SendBrokenConnector {
    inner: Arc<SimConnector>,
}

struct SendBrokenChannel(Box<dyn MessageChannel>);

#[async_trait]
impl MessageChannel for SendBrokenChannel {
    async fn send(&self, _payload: &str) -> Result<(), ChannelError> {
        Err(ChannelError::SendFailed("broken pipe".into()))
    }

    async fn recv(&self) -> ChannelEvent {
        self.0.recv().await
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), ChannelError> {
        self.0.close(code, reason).await
    }
}

#[async_trait]
impl ChannelConnector for SendBrokenConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn MessageChannel>, ChannelError> {
        let channel = self.inner.open(url).await?;
        Ok(Box::new(SendBrokenChannel(channel)))
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_connect_while_connected_opens_nothing() {
    let (manager, connector, _peer) = connected(&stream_config()).await;
    let mut status = manager.subscribe_status();
    let _ = status.borrow_and_update();

    manager.connect();
    manager.connect();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(connector.open_count(), 1);
    assert!(!status.has_changed().unwrap());
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_clean_close_from_server_does_not_reconnect() {
    let (manager, connector, peer) = connected(&stream_config()).await;
    let mut connectivity = manager.subscribe_connectivity();
    assert!(*connectivity.borrow_and_update());

    peer.close(1000, "server shutting down");
    let status = manager.wait_for(|s| !s.is_connected()).await;
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.reconnect_attempts, 0);
    assert!(!*connectivity.borrow_and_update());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.open_count(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_reconnects_after_fixed_delay() {
    let (manager, connector, peer) = connected(&stream_config()).await;

    peer.close(1011, "internal error");
    let status = manager.wait_for(|s| s.is_reconnecting()).await;
    assert_eq!(status.reconnect_attempts, 1);
    assert!(status.last_error.unwrap().contains("1011"));
    assert!(!*manager.subscribe_connectivity().borrow());

    tokio::time::sleep(Duration::from_millis(2900)).await;
    assert_eq!(connector.open_count(), 1);

    let _peer = connector.next_peer().await.unwrap();
    let status = manager.wait_for(|s| s.is_connected()).await;
    assert_eq!(connector.open_count(), 2);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_reconnects() {
    let (manager, connector, peer) = connected(&stream_config()).await;

    peer.fail("connection reset by peer");
    let status = manager.wait_for(|s| s.is_reconnecting()).await;
    assert_eq!(status.last_error.as_deref(), Some("connection reset by peer"));

    let _peer = connector.next_peer().await.unwrap();
    manager.wait_for(|s| s.is_connected()).await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_bounds_open_attempts() {
    let connector = SimConnector::new();
    connector.set_default(OpenOutcome::Refuse("connection refused".into()));
    let manager = StreamSyncManager::new(&stream_config(), connector.clone()).unwrap();

    manager.connect();
    let status = manager.wait_for(|s| s.is_failed()).await;
    // First attempt plus one per unit of budget
    assert_eq!(connector.open_count(), 4);
    assert_eq!(status.reconnect_attempts, 3);
    assert!(status
        .last_error
        .unwrap()
        .contains("maximum reconnection attempts (3)"));

    // Failed is terminal until reconnect()
    manager.connect();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.open_count(), 4);
    assert_eq!(manager.state(), ConnectionState::Failed);

    connector.set_default(OpenOutcome::Accept);
    manager.reconnect();
    let _peer = connector.next_peer().await.unwrap();
    let status = manager.wait_for(|s| s.is_connected()).await;
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(connector.open_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_a_few_refusals() {
    let connector = SimConnector::new();
    connector.refuse_next(2);
    let manager = StreamSyncManager::new(&stream_config(), connector.clone()).unwrap();

    manager.connect();
    let _peer = connector.next_peer().await.unwrap();
    let status = manager.wait_for(|s| s.is_connected()).await;
    assert_eq!(connector.open_count(), 3);
    assert_eq!(status.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_during_reconnect_delay_cancels_it() {
    let (manager, connector, peer) = connected(&stream_config()).await;

    peer.close(1006, "");
    manager.wait_for(|s| s.is_reconnecting()).await;
    manager.close();
    manager
        .wait_for(|s| s.state == ConnectionState::Disconnected)
        .await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_sends_clean_close_and_connect_resumes() {
    let (manager, connector, mut peer) = connected(&stream_config()).await;

    manager.close();
    assert_eq!(
        peer.next_frame().await,
        Some(SentFrame::Close {
            code: 1000,
            reason: "client closed".into()
        })
    );
    manager
        .wait_for(|s| s.state == ConnectionState::Disconnected)
        .await;

    manager.connect();
    let _peer = connector.next_peer().await.unwrap();
    manager.wait_for(|s| s.is_connected()).await;
    assert_eq!(connector.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_open_resolving_after_close_is_discarded() {
    let inner = SimConnector::new();
    let gate = Arc::new(Notify::new());
    let connector = Arc::new(GatedConnector {
        inner: inner.clone(),
        gate: gate.clone(),
    });
    let manager = StreamSyncManager::new(&stream_config(), connector).unwrap();

    manager.connect();
    manager
        .wait_for(|s| s.state == ConnectionState::Connecting)
        .await;
    manager.close();
    manager
        .wait_for(|s| s.state == ConnectionState::Disconnected)
        .await;

    gate.notify_one();
    let mut late = inner.next_peer().await.unwrap();
    assert_eq!(
        late.next_frame().await,
        Some(SentFrame::Close {
            code: 1000,
            reason: "superseded".into()
        })
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_manual_reconnect_replaces_live_channel() {
    let (manager, connector, mut old) = connected(&stream_config()).await;
    let mut changes = manager.store().subscribe();

    manager.reconnect();
    assert_eq!(
        old.next_frame().await,
        Some(SentFrame::Close {
            code: 1000,
            reason: "client closed".into()
        })
    );
    let new = connector.next_peer().await.unwrap();
    manager.wait_for(|s| s.is_connected()).await;

    // Only the new channel feeds the store
    old.push_json(&json!({"type": "state", "sentiments": {"OLD": 1.0}}));
    new.push_json(&json!({"type": "state", "sentiments": {"NEW": 0.5}}));
    next_change(&mut changes).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.sentiments.len(), 1);
    assert_eq!(snapshot.sentiments["NEW"], 0.5);
}

#[tokio::test(start_paused = true)]
async fn test_auth_token_travels_in_url() {
    let config = StreamConfig {
        auth_token: Some("s3cr3t".into()),
        ..stream_config()
    };
    let (_manager, connector, peer) = connected(&config).await;
    assert_eq!(peer.url(), "ws://sim.test/ws/sentiment?token=s3cr3t");
    assert_eq!(connector.opened_urls(), vec![peer.url().to_string()]);
}

// ---------------------------------------------------------------------------
// Keepalive and control messages
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_keepalive_only_while_connected() {
    let (manager, connector, mut peer) = connected(&stream_config()).await;

    tokio::time::sleep(Duration::from_secs(91)).await;
    assert_eq!(peer.drain_frames(), vec![SentFrame::Text("ping".into()); 3]);

    peer.close(1006, "");
    manager.wait_for(|s| s.is_reconnecting()).await;
    connector.set_default(OpenOutcome::Refuse("down".into()));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(peer.drain_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_vanished_peer_triggers_reconnect() {
    let (manager, connector, peer) = connected(&stream_config()).await;

    drop(peer);
    let status = manager.wait_for(|s| !s.is_connected()).await;
    assert_eq!(status.state, ConnectionState::Reconnecting);

    let _peer = connector.next_peer().await.unwrap();
    manager.wait_for(|s| s.is_connected()).await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_keepalive_send_triggers_reconnect() {
    let inner = SimConnector::new();
    let connector = Arc::new(SendBrokenConnector {
        inner: inner.clone(),
    });
    let manager = StreamSyncManager::new(&stream_config(), connector).unwrap();
    manager.connect();
    let _peer = inner.next_peer().await.unwrap();
    manager.wait_for(|s| s.is_connected()).await;

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(manager.is_connected());

    let status = manager.wait_for(|s| !s.is_connected()).await;
    assert_eq!(status.state, ConnectionState::Reconnecting);
    assert!(status.last_error.unwrap().contains("broken pipe"));
}

#[tokio::test(start_paused = true)]
async fn test_full_state_request_is_a_bare_token() {
    let (manager, _connector, mut peer) = connected(&stream_config()).await;
    manager.request_full_state();
    assert_eq!(
        peer.next_frame().await,
        Some(SentFrame::Text("get_state".into()))
    );
}

// ---------------------------------------------------------------------------
// Inbound reconciliation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_full_state_replaces_and_delta_patches() {
    let (manager, _connector, peer) = connected(&stream_config()).await;
    let mut changes = manager.store().subscribe();

    peer.push_json(&json!({"type": "initial_state", "sentiments": {"Z": 0.9}}));
    next_change(&mut changes).await;

    peer.push_json(&json!({"type": "state", "sentiments": {"A": 0.2, "B": -0.4}}));
    assert_eq!(
        next_change(&mut changes).await,
        StoreChange::Replaced { regions: 2 }
    );
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.sentiments.len(), 2);
    assert_eq!(snapshot.sentiments["A"], 0.2);
    assert_eq!(snapshot.sentiments["B"], -0.4);

    peer.push_json(&json!({
        "type": "sentiment_update",
        "department_id": "B",
        "sentiment_score": 0.8,
        "average": 0.5,
        "total_count": 7,
        "timestamp": "2026-02-11T09:30:00.250000"
    }));
    let StoreChange::Region(delta) = next_change(&mut changes).await else {
        panic!("expected a region change");
    };
    assert_eq!(delta.region, "B");

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.sentiments["A"], 0.2);
    assert_eq!(snapshot.sentiments["B"], 0.5);
    assert_eq!(snapshot.sample_counts["B"], 7);
    assert_eq!(manager.update_count(), 1);
    let last = manager.last_update().unwrap();
    assert_eq!(last.average, 0.5);
    assert_eq!(last.latest_score, Some(0.8));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_messages_are_dropped() {
    let (manager, _connector, peer) = connected(&stream_config()).await;
    let mut changes = manager.store().subscribe();

    peer.push_json(&json!({"type": "state", "sentiments": {"A": 0.2, "B": -0.4}}));
    next_change(&mut changes).await;

    peer.push("this is not json");
    peer.push(r#"{"type": "sentiment_update", "average": 0.1}"#);
    peer.push(r#"{"type": "mystery"}"#);
    peer.push_json(&json!({"type": "pong"}));
    peer.push_json(&json!({"type": "sentiment_update", "department_id": "C", "average": 0.1}));

    // The trailing delta is the first change after the garbage
    let StoreChange::Region(delta) = next_change(&mut changes).await else {
        panic!("expected a region change");
    };
    assert_eq!(delta.region, "C");
    assert_eq!(manager.state(), ConnectionState::Connected);
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.sentiments["A"], 0.2);
    assert_eq!(snapshot.sentiments["B"], -0.4);
    assert_eq!(snapshot.update_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_scores_are_clamped() {
    let (manager, _connector, peer) = connected(&stream_config()).await;
    let mut changes = manager.store().subscribe();

    peer.push_json(&json!({"type": "sentiment_update", "department_id": "X", "average": 4.2}));
    next_change(&mut changes).await;
    assert_eq!(manager.store().get("X"), Some(1.0));
}

#[tokio::test(start_paused = true)]
async fn test_observers_see_one_notification_per_full_state() {
    let (manager, _connector, peer) = connected(&stream_config()).await;
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = calls.clone();
    manager.store().on_change(Box::new(move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }));
    let mut changes = manager.store().subscribe();

    peer.push_json(&json!({"type": "state", "sentiments": {"A": 0.1, "B": 0.2, "C": 0.3}}));
    next_change(&mut changes).await;
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_store_survives_reconnection() {
    let (manager, connector, peer) = connected(&stream_config()).await;
    let mut changes = manager.store().subscribe();
    peer.push_json(&json!({"type": "state", "sentiments": {"A": 0.2}}));
    next_change(&mut changes).await;

    peer.close(1006, "");
    manager.wait_for(|s| s.is_reconnecting()).await;
    assert_eq!(manager.store().get("A"), Some(0.2));

    let _peer = connector.next_peer().await.unwrap();
    manager.wait_for(|s| s.is_connected()).await;
    assert_eq!(manager.store().get("A"), Some(0.2));
}
