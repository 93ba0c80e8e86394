//! Offline write queue
//!
//! Writes issued while the API is unreachable are persisted to a durable
//! store and replayed in order once connectivity returns. Only connectivity
//! failures are deferred; a well-formed rejection from the server is always
//! handed straight back to the caller.

pub mod http;
pub mod offline;
pub mod operation;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::storage::StorageError;

pub use http::HttpClient;
pub use offline::{OfflineWriteQueue, ReplayOutcome, ReplayReport};
pub use operation::{Method, QueuedOperation};

/// Failure of a single request to the API.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    /// The server could not be reached at all.
    #[error("Network unreachable: {0}")]
    Unreachable(String),

    /// The server answered with a non-success status.
    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response body: {0}")]
    Decode(String),

    /// The request could not be built or followed: bad URL, redirect loop
    /// and the like. Retrying later would fail the same way.
    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl RequestError {
    /// Whether the failure is down to missing connectivity rather than the
    /// server rejecting the request.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RequestError::Unreachable(_))
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    /// Soft failure: the write was persisted and will be replayed.
    #[error("Queued for later delivery as {id}")]
    Queued { id: Uuid },

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    /// Id of the queued operation, if this is the soft "queued" failure.
    pub fn queued_id(&self) -> Option<Uuid> {
        match self {
            QueueError::Queued { id } => Some(*id),
            _ => None,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.queued_id().is_some()
    }
}

/// Request/response collaborator. Resolves to the parsed JSON body.
#[async_trait]
pub trait RequestClient: Send + Sync {
    async fn request(
        &self,
        path: &str,
        method: Method,
        body: Option<&Value>,
    ) -> Result<Value, RequestError>;
}
