// Voxsync - resilient real-time sync core for the survey dashboard

pub mod channel;
pub mod config;
pub mod connectivity;
pub mod queue;
pub mod storage;
pub mod sync;

pub use channel::{ChannelConnector, ChannelError, ChannelEvent, MessageChannel};
pub use config::{ClientConfig, ConfigError, QueueConfig, StreamConfig};
pub use connectivity::{spawn_replay_on_reconnect, ConnectivityMonitor};
pub use queue::{Method, OfflineWriteQueue, QueueError, QueuedOperation, RequestClient, RequestError};
pub use storage::{KeyValueStore, LocalStore, MemoryStore, StorageError};
pub use sync::{ConnectionState, SentimentStore, StreamSyncManager, SyncStatus};
