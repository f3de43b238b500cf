//! Typed errors for the parts of the engine that branch on failure kind.
//!
//! Most code paths return [`anyhow::Result`] and attach context as they go.
//! The two enums here exist because callers must tell failures apart:
//! the batch writer only provisions on [`StoreError::CollectionMissing`],
//! and callers of the engine may want to detect a diverted batch.

use thiserror::Error;

/// Failure reported by a [`DocumentStore`](crate::store::DocumentStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The target collection (index/table) does not exist yet.
    #[error("collection '{0}' does not exist")]
    CollectionMissing(String),

    /// The store accepted the request but refused one or more documents.
    #[error("store rejected write to '{collection}': {reason}")]
    Rejected { collection: String, reason: String },

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored document could not be decoded.
    #[error("failed to decode stored document: {0}")]
    Decode(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_collection_missing(&self) -> bool {
        matches!(self, StoreError::CollectionMissing(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Terminal failure of a sync invocation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A batch could not be provisioned and was sent to the recovery sink.
    /// The phase stops; its checkpoint stays at the last written batch.
    #[error("{phase} phase of '{stream}' diverted {items} items to the recovery sink")]
    Diverted {
        phase: String,
        stream: String,
        items: usize,
    },

    #[error("{phase} phase failed: {source}")]
    PhaseFailed {
        phase: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{0} phase task panicked")]
    PhasePanicked(String),
}
