//! In-memory change feed over an [`InMemoryDocumentStore`].

use async_trait::async_trait;
use eventide_core::change_feed::{ChangeBatch, ChangeFeed, FeedCursor};
use eventide_core::error::DomainError;

use crate::InMemoryDocumentStore;

/// Delivers every write to the store, in commit order, under a single lease.
///
/// The cursor only moves on `acknowledge`, so an unacknowledged batch is
/// delivered again on the next call.
#[derive(Debug)]
pub struct InMemoryChangeFeed {
    store: InMemoryDocumentStore,
    lease: String,
    cursor: FeedCursor,
    acknowledged: Vec<FeedCursor>,
}

impl InMemoryChangeFeed {
    /// Creates a feed that starts at the beginning of the store's history.
    #[must_use]
    pub fn new(store: InMemoryDocumentStore) -> Self {
        Self {
            store,
            lease: "in-memory".to_owned(),
            cursor: FeedCursor::default(),
            acknowledged: Vec::new(),
        }
    }

    /// The last acknowledged cursor.
    #[must_use]
    pub fn cursor(&self) -> FeedCursor {
        self.cursor
    }

    /// Every cursor acknowledged so far.
    #[must_use]
    pub fn acknowledged(&self) -> &[FeedCursor] {
        &self.acknowledged
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    fn lease(&self) -> &str {
        &self.lease
    }

    async fn next_batch(&mut self, max_batch_size: usize) -> Result<ChangeBatch, DomainError> {
        let from = usize::try_from(self.cursor.0)
            .map_err(|e| DomainError::Infrastructure(format!("cursor out of range: {e}")))?;
        let documents = self.store.feed_slice(from, max_batch_size);
        let cursor = FeedCursor(self.cursor.0 + documents.len() as u64);
        Ok(ChangeBatch {
            lease: self.lease.clone(),
            cursor,
            documents,
        })
    }

    async fn acknowledge(&mut self, batch: &ChangeBatch) -> Result<(), DomainError> {
        if batch.cursor > self.cursor {
            self.cursor = batch.cursor;
        }
        self.acknowledged.push(batch.cursor);
        Ok(())
    }
}
