//! Domain error types.

use thiserror::Error;

use crate::document::DocumentError;

/// Top-level error type shared by the event log, the snapshot store and the
/// catch-up pipeline.
#[derive(Debug, Error)]
pub enum DomainError {
    /// No events or snapshot exist for the given id, or they are soft-deleted.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency conflict on append.
    #[error(
        "concurrency conflict on stream {stream_id}: expected revision {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// The stream that had the conflict.
        stream_id: String,
        /// The revision the caller expected.
        expected: u64,
        /// The revision found in the log after the write was rejected.
        actual: u64,
    },

    /// Caller misuse: mixed stream ids, unregistered event type, malformed id.
    #[error("validation error: {0}")]
    Validation(String),

    /// Folding or upserting a snapshot failed inside the reconciler.
    #[error(
        "reconciliation of stream {stream_id} failed for revisions {from_revision}..={to_revision}: {source}"
    )]
    Reconciliation {
        /// The stream whose snapshot could not be advanced.
        stream_id: String,
        /// First revision the reconciler attempted to apply.
        from_revision: u64,
        /// Last revision the reconciler attempted to apply.
        to_revision: u64,
        /// The underlying failure.
        #[source]
        source: Box<DomainError>,
    },

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// The operation observed its cancellation token and stopped.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<DocumentError> for DomainError {
    fn from(err: DocumentError) -> Self {
        Self::Infrastructure(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Infrastructure(format!("serialization failed: {err}"))
    }
}
