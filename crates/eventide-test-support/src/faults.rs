//! Document stores that inject failures and races.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use eventide_core::document::{
    ContinuationToken, Document, DocumentError, DocumentQuery, DocumentStore, Page, VersionToken,
    Versioned,
};

use crate::InMemoryDocumentStore;

fn refused() -> DocumentError {
    DocumentError::Backend("connection refused".into())
}

/// A document store whose every operation fails. Useful for testing
/// error-handling paths.
#[derive(Debug, Default)]
pub struct FailingDocumentStore;

#[async_trait]
impl DocumentStore for FailingDocumentStore {
    async fn create_if_absent(&self, _document: Document) -> Result<VersionToken, DocumentError> {
        Err(refused())
    }

    async fn create_all_if_absent(
        &self,
        _partition_key: &str,
        _documents: Vec<Document>,
    ) -> Result<Vec<VersionToken>, DocumentError> {
        Err(refused())
    }

    async fn upsert(
        &self,
        _document: Document,
        _if_match: Option<&VersionToken>,
    ) -> Result<VersionToken, DocumentError> {
        Err(refused())
    }

    async fn read(
        &self,
        _partition_key: &str,
        _id: &str,
    ) -> Result<Option<Versioned<Document>>, DocumentError> {
        Err(refused())
    }

    async fn delete(
        &self,
        _partition_key: &str,
        _id: &str,
        _if_match: Option<&VersionToken>,
    ) -> Result<(), DocumentError> {
        Err(refused())
    }

    async fn query(
        &self,
        _query: &DocumentQuery,
        _continuation: Option<&ContinuationToken>,
    ) -> Result<Page, DocumentError> {
        Err(refused())
    }
}

/// Wraps an in-memory store and fails a configured number of upcoming
/// writes (creates and upserts). Reads always pass through.
#[derive(Debug)]
pub struct FlakyDocumentStore {
    inner: InMemoryDocumentStore,
    failures_left: Mutex<usize>,
}

impl FlakyDocumentStore {
    /// Wraps `inner` without any pending failures.
    #[must_use]
    pub fn new(inner: InMemoryDocumentStore) -> Self {
        Self {
            inner,
            failures_left: Mutex::new(0),
        }
    }

    /// Makes the next `count` writes fail.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn fail_next_writes(&self, count: usize) {
        *self.failures_left.lock().unwrap() = count;
    }

    fn should_fail(&self) -> bool {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyDocumentStore {
    async fn create_if_absent(&self, document: Document) -> Result<VersionToken, DocumentError> {
        if self.should_fail() {
            return Err(refused());
        }
        self.inner.create_if_absent(document).await
    }

    async fn create_all_if_absent(
        &self,
        partition_key: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<VersionToken>, DocumentError> {
        if self.should_fail() {
            return Err(refused());
        }
        self.inner.create_all_if_absent(partition_key, documents).await
    }

    async fn upsert(
        &self,
        document: Document,
        if_match: Option<&VersionToken>,
    ) -> Result<VersionToken, DocumentError> {
        if self.should_fail() {
            return Err(refused());
        }
        self.inner.upsert(document, if_match).await
    }

    async fn read(
        &self,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<Versioned<Document>>, DocumentError> {
        self.inner.read(partition_key, id).await
    }

    async fn delete(
        &self,
        partition_key: &str,
        id: &str,
        if_match: Option<&VersionToken>,
    ) -> Result<(), DocumentError> {
        self.inner.delete(partition_key, id, if_match).await
    }

    async fn query(
        &self,
        query: &DocumentQuery,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Page, DocumentError> {
        self.inner.query(query, continuation).await
    }
}

/// Wraps an in-memory store and lets a test slip competing writes in between
/// a writer's read and its conditional write.
///
/// Each document queued with [`Self::race_next_write`] is written
/// unconditionally right before one upcoming write (an `upsert` or a create)
/// is forwarded, so that write observes a concurrent modification. Queued
/// documents are consumed in order, one per write.
#[derive(Debug)]
pub struct RacingDocumentStore {
    inner: InMemoryDocumentStore,
    competing: Mutex<VecDeque<Document>>,
}

impl RacingDocumentStore {
    /// Wraps `inner` with no queued races.
    #[must_use]
    pub fn new(inner: InMemoryDocumentStore) -> Self {
        Self {
            inner,
            competing: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues a competing write for the next write that has none yet.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn race_next_write(&self, document: Document) {
        self.competing.lock().unwrap().push_back(document);
    }

    async fn run_races(&self) -> Result<(), DocumentError> {
        let next = self.competing.lock().unwrap().pop_front();
        if let Some(document) = next {
            self.inner.upsert(document, None).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for RacingDocumentStore {
    async fn create_if_absent(&self, document: Document) -> Result<VersionToken, DocumentError> {
        self.run_races().await?;
        self.inner.create_if_absent(document).await
    }

    async fn create_all_if_absent(
        &self,
        partition_key: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<VersionToken>, DocumentError> {
        self.run_races().await?;
        self.inner.create_all_if_absent(partition_key, documents).await
    }

    async fn upsert(
        &self,
        document: Document,
        if_match: Option<&VersionToken>,
    ) -> Result<VersionToken, DocumentError> {
        self.run_races().await?;
        self.inner.upsert(document, if_match).await
    }

    async fn read(
        &self,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<Versioned<Document>>, DocumentError> {
        self.inner.read(partition_key, id).await
    }

    async fn delete(
        &self,
        partition_key: &str,
        id: &str,
        if_match: Option<&VersionToken>,
    ) -> Result<(), DocumentError> {
        self.inner.delete(partition_key, id, if_match).await
    }

    async fn query(
        &self,
        query: &DocumentQuery,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Page, DocumentError> {
        self.inner.query(query, continuation).await
    }
}
