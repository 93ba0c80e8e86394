//! Client configuration
//!
//! Loaded from a JSON file; every field has a default so partial files
//! work. A handful of environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::sync::state::ReconnectPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub stream: StreamConfig,
    pub queue: QueueConfig,
    /// Root directory for durable state
    pub storage_dir: PathBuf,
    /// Namespace inside `storage_dir`; one per profile
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Sentiment stream endpoint (ws:// or wss://)
    pub url: String,
    /// Appended to the URL as the `token` query parameter
    pub auth_token: Option<String>,
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub keepalive_interval_ms: u64,
    /// Recent deltas kept for display
    pub history_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Base URL the request paths are resolved against
    pub api_base_url: String,
    /// Key the queue is persisted under
    pub storage_key: String,
    /// Re-queue items that fail during replay instead of dropping them
    pub retain_failed: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            queue: QueueConfig::default(),
            storage_dir: PathBuf::from(".voxsync"),
            namespace: "voxsync".to_string(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws/sentiment".to_string(),
            auth_token: None,
            auto_reconnect: true,
            reconnect_interval_ms: 3000,
            max_reconnect_attempts: 10,
            keepalive_interval_ms: 30_000,
            history_limit: 50,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api/v1".to_string(),
            storage_key: "offline_queue".to_string(),
            retain_failed: false,
        }
    }
}

impl StreamConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: self.auto_reconnect,
            delay: Duration::from_millis(self.reconnect_interval_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// The URL to open, with the auth token attached.
    pub fn channel_url(&self) -> Result<String, ConfigError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| ConfigError::Invalid(format!("stream url {:?}: {}", self.url, e)))?;
        if let Some(token) = self.auth_token.as_deref().filter(|t| !t.is_empty()) {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.into())
    }

    /// The URL without query, safe to log.
    pub fn display_url(&self) -> String {
        match Url::parse(&self.url) {
            Ok(mut url) => {
                url.set_query(None);
                url.into()
            }
            Err(_) => self.url.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel_url()?;
        if self.reconnect_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_interval_ms must be positive".to_string(),
            ));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "keepalive_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.api_base_url).map_err(|e| {
            ConfigError::Invalid(format!("api base url {:?}: {}", self.api_base_url, e))
        })?;
        if self.storage_key.is_empty() {
            return Err(ConfigError::Invalid("storage_key must not be empty".to_string()));
        }
        Ok(())
    }
}

impl ClientConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `VOXSYNC_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("VOXSYNC_STREAM_URL") {
            self.stream.url = url;
        }
        if let Some(url) = lookup("VOXSYNC_API_URL") {
            self.queue.api_base_url = url;
        }
        if let Some(token) = lookup("VOXSYNC_AUTH_TOKEN") {
            self.stream.auth_token = Some(token);
        }
        if let Some(dir) = lookup("VOXSYNC_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stream.validate()?;
        self.queue.validate()?;
        if self.namespace.is_empty() || self.namespace.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "namespace {:?} is not a plain name",
                self.namespace
            )));
        }
        Ok(())
    }
}
