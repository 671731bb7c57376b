//! In-memory document store with the same conditional-write semantics as the
//! PostgreSQL backend.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use eventide_core::clock::{Clock, SystemClock};
use eventide_core::document::{
    ContinuationToken, Document, DocumentError, DocumentQuery, DocumentStore, Page, VersionToken,
    Versioned,
};

type Key = (String, String);

#[derive(Debug)]
struct Inner {
    documents: BTreeMap<Key, Versioned<Document>>,
    next_version: u64,
    /// Every successful write, in commit order. Read by the change feed.
    feed: Vec<Document>,
    writes: usize,
}

impl Inner {
    fn next_token(&mut self) -> VersionToken {
        self.next_version += 1;
        VersionToken::new(format!("v{}", self.next_version))
    }

    fn write(&mut self, document: Document) -> VersionToken {
        let token = self.next_token();
        let key = (document.partition_key.clone(), document.id.clone());
        self.feed.push(document.clone());
        self.writes += 1;
        self.documents.insert(
            key,
            Versioned {
                value: document,
                token: token.clone(),
            },
        );
        token
    }
}

/// A thread-safe in-memory document store. Clones share the same data.
#[derive(Clone)]
pub struct InMemoryDocumentStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDocumentStore")
            .field("documents", &self.lock().documents.len())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentStore {
    /// Creates an empty store that checks expiry against the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store that checks expiry against `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                documents: BTreeMap::new(),
                next_version: 0,
                feed: Vec::new(),
                writes: 0,
            })),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Number of live documents, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().documents.len()
    }

    /// Returns `true` if the store holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful writes since creation.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Returns the raw document at `(partition_key, id)`, ignoring expiry.
    #[must_use]
    pub fn raw(&self, partition_key: &str, id: &str) -> Option<Document> {
        self.lock()
            .documents
            .get(&(partition_key.to_owned(), id.to_owned()))
            .map(|v| v.value.clone())
    }

    /// Writes recorded after feed position `from`, at most `max`.
    pub(crate) fn feed_slice(&self, from: usize, max: usize) -> Vec<Document> {
        self.lock().feed.iter().skip(from).take(max).cloned().collect()
    }

    fn live(&self, inner: &Inner, key: &Key) -> Option<Versioned<Document>> {
        let now = self.clock.now();
        inner
            .documents
            .get(key)
            .filter(|v| !v.value.is_expired(now))
            .cloned()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn create_if_absent(&self, document: Document) -> Result<VersionToken, DocumentError> {
        let partition_key = document.partition_key.clone();
        self.create_all_if_absent(&partition_key, vec![document])
            .await?
            .pop()
            .ok_or_else(|| DocumentError::Backend("create produced no token".into()))
    }

    async fn create_all_if_absent(
        &self,
        partition_key: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<VersionToken>, DocumentError> {
        let mut inner = self.lock();
        for document in &documents {
            if document.partition_key != partition_key {
                return Err(DocumentError::Backend(format!(
                    "document {} targets partition {} inside a batch for {partition_key}",
                    document.id, document.partition_key
                )));
            }
            let key = (document.partition_key.clone(), document.id.clone());
            if self.live(&inner, &key).is_some() {
                return Err(DocumentError::AlreadyExists {
                    partition_key: key.0,
                    id: key.1,
                });
            }
        }
        Ok(documents
            .into_iter()
            .map(|document| inner.write(document))
            .collect())
    }

    async fn upsert(
        &self,
        document: Document,
        if_match: Option<&VersionToken>,
    ) -> Result<VersionToken, DocumentError> {
        let mut inner = self.lock();
        if let Some(expected) = if_match {
            let key = (document.partition_key.clone(), document.id.clone());
            let current = self.live(&inner, &key).map(|v| v.token);
            if current.as_ref() != Some(expected) {
                return Err(DocumentError::TokenMismatch {
                    partition_key: key.0,
                    id: key.1,
                });
            }
        }
        Ok(inner.write(document))
    }

    async fn read(
        &self,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<Versioned<Document>>, DocumentError> {
        let inner = self.lock();
        Ok(self.live(&inner, &(partition_key.to_owned(), id.to_owned())))
    }

    async fn delete(
        &self,
        partition_key: &str,
        id: &str,
        if_match: Option<&VersionToken>,
    ) -> Result<(), DocumentError> {
        let mut inner = self.lock();
        let key = (partition_key.to_owned(), id.to_owned());
        if let Some(expected) = if_match {
            let current = self.live(&inner, &key).map(|v| v.token);
            if current.as_ref() != Some(expected) {
                return Err(DocumentError::TokenMismatch {
                    partition_key: key.0,
                    id: key.1,
                });
            }
        }
        inner.documents.remove(&key);
        Ok(())
    }

    async fn query(
        &self,
        query: &DocumentQuery,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Page, DocumentError> {
        let offset = match continuation {
            Some(token) => token.0.parse::<usize>().map_err(|e| {
                DocumentError::Backend(format!("malformed continuation {:?}: {e}", token.0))
            })?,
            None => 0,
        };
        let now = self.clock.now();
        let mut matching: Vec<Versioned<Document>> = self
            .lock()
            .documents
            .values()
            .filter(|v| !v.value.is_expired(now) && query.matches(&v.value))
            .cloned()
            .collect();
        matching.sort_by(|a, b| query.compare(&a.value, &b.value));

        let page_size = query.page_size.max(1);
        let documents: Vec<_> = matching.iter().skip(offset).take(page_size).cloned().collect();
        let next = offset + documents.len();
        let continuation = (next < matching.len()).then(|| ContinuationToken(next.to_string()));
        Ok(Page {
            documents,
            continuation,
        })
    }
}
