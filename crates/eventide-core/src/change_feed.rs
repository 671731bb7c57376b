//! Change feed contract.
//!
//! A change feed delivers newly written documents of one container in
//! batches, at least once. Each feed instance owns one lease (a disjoint range
//! of partitions) and a cursor that only advances when a batch is
//! acknowledged; an unacknowledged batch is delivered again.

use async_trait::async_trait;

use crate::document::Document;
use crate::error::DomainError;

/// Position in a feed after which delivery resumes once acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct FeedCursor(pub u64);

/// A batch of raw documents delivered by a change feed.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    /// Lease the batch was delivered under.
    pub lease: String,
    /// Cursor to persist when the batch is acknowledged.
    pub cursor: FeedCursor,
    /// Newly written documents, in arrival order.
    pub documents: Vec<Document>,
}

impl ChangeBatch {
    /// Returns `true` if the batch carries no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Number of documents in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }
}

/// At-least-once, batched delivery of newly written documents.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Identifier of the lease this feed owns.
    fn lease(&self) -> &str;

    /// Fetches up to `max_batch_size` documents after the last acknowledged
    /// cursor. An empty batch means the feed is caught up.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the feed cannot be read.
    async fn next_batch(&mut self, max_batch_size: usize) -> Result<ChangeBatch, DomainError>;

    /// Advances the lease past `batch`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the cursor cannot be stored.
    async fn acknowledge(&mut self, batch: &ChangeBatch) -> Result<(), DomainError>;
}
