//! Connection state machine
//!
//! `SyncMachine` is a pure transition function: it takes an event, updates
//! its own bookkeeping and returns the effects the driver must carry out.
//! It never touches channels or timers, so every transition can be tested
//! without a network or a clock.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::CLEAN_CLOSE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Reconnection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Fixed delay between a failure and the next attempt.
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_millis(3000),
            max_attempts: 10,
        }
    }
}

/// Reconnection attempts made since the last successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    attempts: u32,
    max_attempts: u32,
}

impl RetryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Consume one attempt. Returns false if none were left.
    pub fn try_consume(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectRequested,
    ReconnectRequested,
    CloseRequested,
    OpenSucceeded,
    OpenFailed(String),
    ChannelClosed { code: u16, reason: String },
    TransportError(String),
    RetryDelayElapsed,
}

/// Work the driver must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Start opening a new channel. Supersedes any open still in flight.
    OpenChannel,
    /// Adopt the channel whose open just succeeded and arm the keepalive.
    ActivateSession,
    /// Close a channel whose open resolved after it was superseded.
    DiscardChannel,
    /// Stop the keepalive and drop the current channel, which is already dead.
    EndSession,
    /// Send a clean close on the current channel (if any), then drop it.
    CloseChannel,
    /// Arm the reconnect timer.
    ArmRetry(Duration),
    /// Disarm the reconnect timer.
    CancelRetry,
}

#[derive(Debug, Clone)]
pub struct SyncMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    budget: RetryBudget,
    /// Cleared by `close()`, restored by `connect()`/`reconnect()`.
    auto_reconnect: bool,
    last_error: Option<String>,
}

impl SyncMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            budget: RetryBudget::new(policy.max_attempts),
            auto_reconnect: policy.enabled,
            policy,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn budget(&self) -> RetryBudget {
        self.budget
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// Apply one event. Events that make no sense in the current state
    /// are ignored, except that a late successful open is discarded.
    pub fn handle(&mut self, event: SyncEvent) -> Vec<Effect> {
        use ConnectionState::*;

        match (self.state, event) {
            (Disconnected, SyncEvent::ConnectRequested) => {
                self.auto_reconnect = self.policy.enabled;
                self.state = Connecting;
                vec![Effect::OpenChannel]
            }
            // connect() is idempotent everywhere else; Failed needs reconnect().
            (_, SyncEvent::ConnectRequested) => Vec::new(),

            (previous, SyncEvent::ReconnectRequested) => {
                self.budget.reset();
                self.auto_reconnect = self.policy.enabled;
                self.state = Connecting;
                let mut effects = Vec::new();
                match previous {
                    Connected => effects.push(Effect::CloseChannel),
                    Reconnecting => effects.push(Effect::CancelRetry),
                    _ => {}
                }
                effects.push(Effect::OpenChannel);
                effects
            }

            (previous, SyncEvent::CloseRequested) => {
                self.auto_reconnect = false;
                self.state = Disconnected;
                match previous {
                    Connected | Connecting => vec![Effect::CloseChannel],
                    Reconnecting => vec![Effect::CancelRetry],
                    Disconnected | Failed => Vec::new(),
                }
            }

            (Connecting, SyncEvent::OpenSucceeded) => {
                self.budget.reset();
                self.last_error = None;
                self.state = Connected;
                vec![Effect::ActivateSession]
            }
            (_, SyncEvent::OpenSucceeded) => vec![Effect::DiscardChannel],

            (Connecting, SyncEvent::OpenFailed(reason)) => {
                self.last_error = Some(reason);
                self.schedule_retry(Vec::new())
            }

            (Connected, SyncEvent::ChannelClosed { code, reason }) if code == CLEAN_CLOSE => {
                log::debug!("Server closed the stream cleanly: {}", reason);
                self.state = Disconnected;
                vec![Effect::EndSession]
            }
            (Connected, SyncEvent::ChannelClosed { code, reason }) => {
                self.last_error = Some(if reason.is_empty() {
                    format!("connection closed abnormally (code {})", code)
                } else {
                    format!("connection closed abnormally (code {}): {}", code, reason)
                });
                self.schedule_retry(vec![Effect::EndSession])
            }
            (Connected, SyncEvent::TransportError(error)) => {
                self.last_error = Some(error);
                self.schedule_retry(vec![Effect::EndSession])
            }

            (Reconnecting, SyncEvent::RetryDelayElapsed) => {
                self.state = Connecting;
                vec![Effect::OpenChannel]
            }

            // Stale channel events, timer fires after cancellation, and
            // failures reported for states that already moved on.
            (_, _) => Vec::new(),
        }
    }

    /// Enter Reconnecting if allowed and budget remains, else Failed.
    fn schedule_retry(&mut self, mut effects: Vec<Effect>) -> Vec<Effect> {
        if !self.auto_reconnect {
            self.state = ConnectionState::Failed;
            return effects;
        }
        if self.budget.try_consume() {
            self.state = ConnectionState::Reconnecting;
            effects.push(Effect::ArmRetry(self.policy.delay));
        } else {
            self.state = ConnectionState::Failed;
            self.last_error = Some(format!(
                "maximum reconnection attempts ({}) reached",
                self.budget.max_attempts()
            ));
        }
        effects
    }
}
