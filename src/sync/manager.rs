//! StreamSyncManager - keeps one streaming session alive
//!
//! The public handle only sends commands. All connection state lives in a
//! single driver task that processes commands, channel events and timers
//! one at a time, feeding them through `SyncMachine` and carrying out the
//! resulting effects. Every channel open is tagged with a generation so
//! that results and events from superseded channels are recognised and
//! dropped instead of being mistaken for the current session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::channel::{ChannelConnector, ChannelError, ChannelEvent, MessageChannel, CLEAN_CLOSE};
use crate::config::{ConfigError, StreamConfig};

use super::message::{RegionDelta, SentimentUpdate, PING_TOKEN, REQUEST_STATE_TOKEN};
use super::state::{ConnectionState, Effect, SyncEvent, SyncMachine};
use super::store::{SentimentSnapshot, SentimentStore};

/// Observable connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    /// Cleared on a successful connect.
    pub last_error: Option<String>,
}

impl SyncStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state == ConnectionState::Reconnecting
    }

    pub fn is_failed(&self) -> bool {
        self.state == ConnectionState::Failed
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Reconnect,
    RequestFullState,
    Close,
}

/// Handle to a running sync session.
///
/// Must be created inside a tokio runtime. Dropping the handle shuts the
/// driver down and closes any open channel cleanly.
pub struct StreamSyncManager {
    commands: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<SyncStatus>,
    connected_rx: watch::Receiver<bool>,
    store: SentimentStore,
    driver: JoinHandle<()>,
}

impl StreamSyncManager {
    /// Spawn the driver. Nothing is opened until `connect()`.
    pub fn new(
        config: &StreamConfig,
        connector: Arc<dyn ChannelConnector>,
    ) -> Result<Self, ConfigError> {
        let store = SentimentStore::with_history_limit(config.history_limit);
        Self::with_store(config, connector, store)
    }

    /// Like `new`, writing into an existing store.
    pub fn with_store(
        config: &StreamConfig,
        connector: Arc<dyn ChannelConnector>,
        store: SentimentStore,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let url = config.channel_url()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SyncStatus::default());
        let (connected_tx, connected_rx) = watch::channel(false);
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();

        let driver = SyncDriver {
            machine: SyncMachine::new(config.reconnect_policy()),
            connector,
            url,
            display_url: config.display_url(),
            keepalive_period: config.keepalive_interval(),
            store: store.clone(),
            status_tx,
            connected_tx,
            commands: commands_rx,
            inputs_tx,
            inputs_rx,
            generation: 0,
            channel: None,
            pending: None,
            reader: None,
            retry_at: None,
            keepalive: None,
        };
        let driver = tokio::spawn(driver.run());

        Ok(Self {
            commands: commands_tx,
            status_rx,
            connected_rx,
            store,
            driver,
        })
    }

    /// Open the stream. No-op unless currently disconnected.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Reset the retry budget and open a fresh channel, whatever the state.
    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    /// Ask the server to resend the full map. Dropped unless connected.
    pub fn request_full_state(&self) {
        self.send(Command::RequestFullState);
    }

    /// Clean shutdown. Disables auto-reconnect until the next `connect()`.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    pub fn status(&self) -> SyncStatus {
        self.status_rx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.status_rx.borrow().is_connected()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status_rx.borrow().is_reconnecting()
    }

    pub fn last_error(&self) -> Option<String> {
        self.status_rx.borrow().last_error.clone()
    }

    /// Follow status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Follow connectivity; changes only on connect and disconnect.
    pub fn subscribe_connectivity(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl FnMut(&SyncStatus) -> bool) -> SyncStatus {
        let mut rx = self.status_rx.clone();
        let status = match rx.wait_for(predicate).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        status
    }

    pub fn store(&self) -> &SentimentStore {
        &self.store
    }

    pub fn snapshot(&self) -> SentimentSnapshot {
        self.store.snapshot()
    }

    pub fn last_update(&self) -> Option<RegionDelta> {
        self.store.last_update()
    }

    pub fn update_count(&self) -> u64 {
        self.store.update_count()
    }

    /// Whether the driver task has exited.
    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::warn!("Sync driver is gone, dropping {:?}", command);
        }
    }
}

enum DriverInput {
    Opened {
        generation: u64,
        result: Result<Box<dyn MessageChannel>, ChannelError>,
    },
    Channel {
        generation: u64,
        event: ChannelEvent,
    },
}

enum Wake {
    Command(Command),
    Input(DriverInput),
    RetryDue,
    KeepaliveDue,
    Shutdown,
}

struct SyncDriver {
    machine: SyncMachine,
    connector: Arc<dyn ChannelConnector>,
    url: String,
    display_url: String,
    keepalive_period: Duration,
    store: SentimentStore,
    status_tx: watch::Sender<SyncStatus>,
    connected_tx: watch::Sender<bool>,
    commands: mpsc::UnboundedReceiver<Command>,
    inputs_tx: mpsc::UnboundedSender<DriverInput>,
    inputs_rx: mpsc::UnboundedReceiver<DriverInput>,
    /// Bumped whenever the current channel or pending open is abandoned.
    generation: u64,
    channel: Option<Arc<dyn MessageChannel>>,
    /// Opened channel waiting for the machine to adopt or discard it.
    pending: Option<Box<dyn MessageChannel>>,
    reader: Option<JoinHandle<()>>,
    retry_at: Option<Instant>,
    keepalive: Option<Interval>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl SyncDriver {
    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::Shutdown,
                },
                Some(input) = self.inputs_rx.recv() => Wake::Input(input),
                _ = sleep_until_opt(self.retry_at) => Wake::RetryDue,
                _ = tick_opt(&mut self.keepalive) => Wake::KeepaliveDue,
            };

            match wake {
                Wake::Command(command) => self.handle_command(command).await,
                Wake::Input(input) => self.handle_input(input).await,
                Wake::RetryDue => {
                    self.retry_at = None;
                    self.apply(SyncEvent::RetryDelayElapsed).await;
                }
                Wake::KeepaliveDue => self.send_control(PING_TOKEN).await,
                Wake::Shutdown => {
                    self.shutdown().await;
                    break;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.apply(SyncEvent::ConnectRequested).await,
            Command::Reconnect => self.apply(SyncEvent::ReconnectRequested).await,
            Command::Close => self.apply(SyncEvent::CloseRequested).await,
            Command::RequestFullState => {
                if self.machine.state() == ConnectionState::Connected {
                    self.send_control(REQUEST_STATE_TOKEN).await;
                } else {
                    log::debug!(
                        "Ignoring full-state request while {}",
                        self.machine.state()
                    );
                }
            }
        }
    }

    async fn handle_input(&mut self, input: DriverInput) {
        match input {
            DriverInput::Opened { generation, result } => {
                if generation != self.generation {
                    if let Ok(channel) = result {
                        log::debug!("Closing superseded channel (generation {})", generation);
                        let _ = channel.close(CLEAN_CLOSE, "superseded").await;
                    }
                    return;
                }
                match result {
                    Ok(channel) => {
                        self.pending = Some(channel);
                        self.apply(SyncEvent::OpenSucceeded).await;
                        // Not adopted: the machine moved on while we waited
                        if let Some(channel) = self.pending.take() {
                            let _ = channel.close(CLEAN_CLOSE, "superseded").await;
                        }
                    }
                    Err(e) => {
                        log::warn!("Failed to open {}: {}", self.display_url, e);
                        self.apply(SyncEvent::OpenFailed(e.to_string())).await;
                    }
                }
            }
            DriverInput::Channel { generation, event } => {
                if generation != self.generation {
                    log::trace!("Ignoring event from stale channel: {:?}", event);
                    return;
                }
                match event {
                    ChannelEvent::Message(text) => self.dispatch(&text),
                    ChannelEvent::Error(error) => {
                        log::warn!("Transport error on {}: {}", self.display_url, error);
                        self.apply(SyncEvent::TransportError(error)).await;
                    }
                    ChannelEvent::Closed { code, reason } => {
                        if code != CLEAN_CLOSE {
                            log::warn!("Stream closed abnormally (code {}): {}", code, reason);
                        }
                        self.apply(SyncEvent::ChannelClosed { code, reason }).await;
                    }
                }
            }
        }
    }

    /// Decode and apply one inbound message. Malformed input is dropped.
    fn dispatch(&self, text: &str) {
        if self.machine.state() != ConnectionState::Connected {
            return;
        }
        match SentimentUpdate::parse(text) {
            Ok(SentimentUpdate::FullState { mapping }) => {
                log::debug!("Received full state with {} regions", mapping.len());
                self.store.replace_all(mapping);
            }
            Ok(SentimentUpdate::DeltaUpdate(delta)) => {
                log::trace!("Region {} -> {:.4}", delta.region, delta.average);
                self.store.apply_delta(delta);
            }
            Ok(SentimentUpdate::Heartbeat) => log::trace!("Heartbeat acknowledged"),
            Err(e) => log::warn!("Dropping inbound message: {}", e),
        }
    }

    async fn send_control(&mut self, token: &str) {
        if self.machine.state() != ConnectionState::Connected {
            return;
        }
        let Some(channel) = self.channel.clone() else {
            return;
        };
        if let Err(e) = channel.send(token).await {
            log::warn!("Failed to send {:?}: {}", token, e);
            self.apply(SyncEvent::TransportError(e.to_string())).await;
        }
    }

    async fn apply(&mut self, event: SyncEvent) {
        let before = self.machine.state();
        let effects = self.machine.handle(event);
        for effect in effects {
            self.execute(effect).await;
        }
        let after = self.machine.state();
        if before != after {
            match after {
                ConnectionState::Connected => log::info!("Connected to {}", self.display_url),
                ConnectionState::Failed => log::warn!(
                    "Stream failed: {}",
                    self.machine.last_error().unwrap_or("unknown error")
                ),
                _ => log::debug!("Stream state {} -> {}", before, after),
            }
        }
        self.publish();
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::OpenChannel => {
                self.generation += 1;
                let generation = self.generation;
                let connector = Arc::clone(&self.connector);
                let url = self.url.clone();
                let inputs = self.inputs_tx.clone();
                tokio::spawn(async move {
                    let result = connector.open(&url).await;
                    let _ = inputs.send(DriverInput::Opened { generation, result });
                });
            }
            Effect::ActivateSession => {
                let Some(channel) = self.pending.take() else {
                    return;
                };
                let channel: Arc<dyn MessageChannel> = Arc::from(channel);
                self.channel = Some(Arc::clone(&channel));
                self.reader = Some(self.spawn_reader(channel));

                let mut keepalive = interval_at(
                    Instant::now() + self.keepalive_period,
                    self.keepalive_period,
                );
                keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.keepalive = Some(keepalive);
            }
            Effect::DiscardChannel => {
                if let Some(channel) = self.pending.take() {
                    let _ = channel.close(CLEAN_CLOSE, "superseded").await;
                }
            }
            Effect::EndSession => self.end_session(),
            Effect::CloseChannel => {
                if let Some(channel) = self.channel.take() {
                    if let Err(e) = channel.close(CLEAN_CLOSE, "client closed").await {
                        log::debug!("Error sending close: {}", e);
                    }
                }
                self.end_session();
            }
            Effect::ArmRetry(delay) => {
                log::info!(
                    "Reconnecting in {:?} (attempt {}/{})",
                    delay,
                    self.machine.budget().attempts(),
                    self.machine.budget().max_attempts()
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            Effect::CancelRetry => self.retry_at = None,
        }
    }

    fn spawn_reader(&self, channel: Arc<dyn MessageChannel>) -> JoinHandle<()> {
        let generation = self.generation;
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            loop {
                let event = channel.recv().await;
                let terminal = event.is_terminal();
                if inputs
                    .send(DriverInput::Channel { generation, event })
                    .is_err()
                    || terminal
                {
                    break;
                }
            }
        })
    }

    /// Forget the current channel and invalidate anything still in flight.
    fn end_session(&mut self) {
        self.keepalive = None;
        self.channel = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.generation += 1;
    }

    async fn shutdown(&mut self) {
        if let Some(channel) = self.channel.take() {
            let _ = channel.close(CLEAN_CLOSE, "client shutdown").await;
        }
        self.end_session();
        self.retry_at = None;
    }

    fn publish(&self) {
        let status = SyncStatus {
            state: self.machine.state(),
            reconnect_attempts: self.machine.budget().attempts(),
            last_error: self.machine.last_error().map(str::to_string),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });

        let connected = self.machine.state() == ConnectionState::Connected;
        self.connected_tx.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            *current = connected;
            true
        });
    }
}
