//! Streaming sentiment sync
//!
//! A long-lived channel to the sentiment stream, kept alive by a bounded
//! reconnection state machine, with inbound updates reconciled into a
//! shared reactive store. The transition logic (`state`) is pure; the
//! manager runs it against real channels and tokio timers.

pub mod manager;
pub mod message;
pub mod state;
pub mod store;

pub use manager::{StreamSyncManager, SyncStatus};
pub use message::{ParseError, RegionDelta, SentimentUpdate};
pub use state::{ConnectionState, ReconnectPolicy, RetryBudget};
pub use store::{SentimentSnapshot, SentimentStore, StoreChange};
