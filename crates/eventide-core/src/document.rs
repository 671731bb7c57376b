//! Partitioned document store contract.
//!
//! The event log and the snapshot store persist everything through this
//! trait. Its per-partition conditional writes are the only synchronization
//! primitive the engine relies on.

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// Opaque value identifying one version of a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionToken(String);

impl VersionToken {
    /// Wraps a backend-specific token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A JSON document addressed by `(partition_key, id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Partition the document lives in.
    pub partition_key: String,
    /// Identifier, unique within the partition.
    pub id: String,
    /// Document body.
    pub body: Value,
    /// Optional expiry; expired documents are invisible to reads and queries.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Document {
    /// Creates a document that never expires.
    #[must_use]
    pub fn new(partition_key: impl Into<String>, id: impl Into<String>, body: Value) -> Self {
        Self {
            partition_key: partition_key.into(),
            id: id.into(),
            body,
            expires_at: None,
        }
    }

    /// Returns `true` if the document has expired as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A value paired with the version token it was read or written at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// The value.
    pub value: T,
    /// The store's version token for it.
    pub token: VersionToken,
}

/// Errors surfaced by document store implementations.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// A conditional create found the slot already occupied.
    #[error("document {partition_key}/{id} already exists")]
    AlreadyExists {
        /// Partition of the occupied slot.
        partition_key: String,
        /// Id of the occupied slot.
        id: String,
    },

    /// A conditional write found a different version than the one supplied.
    #[error("version token mismatch on document {partition_key}/{id}")]
    TokenMismatch {
        /// Partition of the document.
        partition_key: String,
        /// Id of the document.
        id: String,
    },

    /// Any backend failure (connection, serialization, constraint).
    #[error("document store error: {0}")]
    Backend(String),
}

/// Comparison applied by a [`FieldFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Field equals the value.
    Eq,
    /// Field differs from the value.
    Ne,
    /// Field is greater than the value.
    Gt,
    /// Field is greater than or equal to the value.
    Gte,
    /// Field is less than the value.
    Lt,
    /// Field is less than or equal to the value.
    Lte,
    /// Field is absent or JSON `null`.
    IsNull,
    /// Field is present and not JSON `null`.
    IsNotNull,
}

/// Looks up a dotted field path (`state.name`) in a document body.
#[must_use]
pub fn field_value<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(body, |value, segment| value.get(segment))
}

/// Predicate over a field of a document body.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    /// Dotted field path.
    pub field: String,
    /// Comparison.
    pub op: FilterOp,
    /// Right-hand operand; ignored by the null checks.
    pub value: Value,
}

impl FieldFilter {
    /// Creates a filter.
    #[must_use]
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// `field == value`
    #[must_use]
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value.into())
    }

    /// `field > value`
    #[must_use]
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gt, value.into())
    }

    /// `field <= value`
    #[must_use]
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lte, value.into())
    }

    /// `field IS NULL` (absent or JSON `null`).
    #[must_use]
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOp::IsNull, Value::Null)
    }

    /// Evaluates the filter against a document body.
    ///
    /// Comparisons against an absent field are false, matching SQL `NULL`
    /// semantics of the PostgreSQL backend.
    #[must_use]
    pub fn matches(&self, body: &Value) -> bool {
        let field = field_value(body, &self.field);
        let ordering = || field.map(|f| compare_json(f, &self.value));
        match self.op {
            FilterOp::IsNull => field.is_none_or(Value::is_null),
            FilterOp::IsNotNull => field.is_some_and(|v| !v.is_null()),
            FilterOp::Eq => ordering() == Some(Ordering::Equal),
            FilterOp::Ne => ordering().is_some_and(Ordering::is_ne),
            FilterOp::Gt => ordering() == Some(Ordering::Greater),
            FilterOp::Gte => ordering().is_some_and(Ordering::is_ge),
            FilterOp::Lt => ordering() == Some(Ordering::Less),
            FilterOp::Lte => ordering().is_some_and(Ordering::is_le),
        }
    }
}

/// Sort direction for [`SortOrder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// Ordering over a field of a document body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrder {
    /// Dotted field path.
    pub field: String,
    /// Direction.
    pub direction: SortDirection,
}

impl SortOrder {
    /// Compares two bodies by the sort field. Absent fields sort last in
    /// ascending order, as `NULLS LAST` does.
    #[must_use]
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let ordering = match (field_value(a, &self.field), field_value(b, &self.field)) {
            (Some(a), Some(b)) => compare_json(a, b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        match self.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }
}

/// Total order over JSON values, following PostgreSQL's `jsonb` ordering:
/// `null < string < number < boolean < array < object`.
#[must_use]
pub fn compare_json(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::String(_) => 1,
            Value::Number(_) => 2,
            Value::Bool(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.total_cmp(&b)
        }
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        // Longer arrays are greater, as in jsonb.
        (Value::Array(a), Value::Array(b)) => a.len().cmp(&b.len()).then_with(|| {
            a.iter()
                .zip(b)
                .map(|(a, b)| compare_json(a, b))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        }),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Shape of a bulk query: partition scope, predicates, ordering and page size.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentQuery {
    /// Restrict to one partition; `None` queries across partitions.
    pub partition_key: Option<String>,
    /// All filters must match.
    pub filters: Vec<FieldFilter>,
    /// Result ordering. Ties are broken by `(partition_key, id)`.
    pub order_by: Option<SortOrder>,
    /// Maximum documents per page.
    pub page_size: usize,
}

impl Default for DocumentQuery {
    fn default() -> Self {
        Self {
            partition_key: None,
            filters: Vec::new(),
            order_by: None,
            page_size: 100,
        }
    }
}

impl DocumentQuery {
    /// A cross-partition query with no filters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the query to one partition.
    #[must_use]
    pub fn in_partition(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    /// Adds a filter.
    #[must_use]
    pub fn filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Sets the ordering.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(SortOrder {
            field: field.into(),
            direction,
        });
        self
    }

    /// Sets the page size (at least one).
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Returns `true` if the document satisfies the partition scope and
    /// every filter.
    #[must_use]
    pub fn matches(&self, document: &Document) -> bool {
        self.partition_key
            .as_deref()
            .is_none_or(|pk| pk == document.partition_key)
            && self.filters.iter().all(|f| f.matches(&document.body))
    }

    /// Compares two documents by the query's ordering, then by
    /// `(partition_key, id)` so pagination is stable.
    #[must_use]
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        self.order_by
            .as_ref()
            .map_or(Ordering::Equal, |order| order.compare(&a.body, &b.body))
            .then_with(|| a.partition_key.cmp(&b.partition_key))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Opaque cursor for fetching the next page of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken(pub String);

/// One page of query results.
#[derive(Debug, Clone)]
pub struct Page {
    /// Documents on this page, in query order.
    pub documents: Vec<Versioned<Document>>,
    /// Cursor for the next page; `None` when the query is exhausted.
    pub continuation: Option<ContinuationToken>,
}

/// Partitioned document store with conditional writes.
///
/// One instance addresses one container (for example `events` or
/// `snapshots`).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates the document unless `(partition_key, id)` is already taken.
    ///
    /// # Errors
    ///
    /// Returns `DocumentError::AlreadyExists` if the slot is occupied.
    async fn create_if_absent(&self, document: Document) -> Result<VersionToken, DocumentError>;

    /// Creates every document in one partition atomically, or none of them if
    /// any slot is already taken.
    ///
    /// # Errors
    ///
    /// Returns `DocumentError::AlreadyExists` for the first occupied slot, or
    /// `DocumentError::Backend` if a document names another partition.
    async fn create_all_if_absent(
        &self,
        partition_key: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<VersionToken>, DocumentError>;

    /// Replaces (or creates) the document. With `if_match`, the write only
    /// succeeds if the stored version still carries that token.
    ///
    /// # Errors
    ///
    /// Returns `DocumentError::TokenMismatch` if the condition fails.
    async fn upsert(
        &self,
        document: Document,
        if_match: Option<&VersionToken>,
    ) -> Result<VersionToken, DocumentError>;

    /// Point read. Absent and expired documents read as `None`.
    ///
    /// # Errors
    ///
    /// Returns `DocumentError::Backend` on store failure.
    async fn read(
        &self,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<Versioned<Document>>, DocumentError>;

    /// Deletes the document. Deleting an absent document without `if_match`
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns `DocumentError::TokenMismatch` if `if_match` does not match.
    async fn delete(
        &self,
        partition_key: &str,
        id: &str,
        if_match: Option<&VersionToken>,
    ) -> Result<(), DocumentError>;

    /// Fetches one page of a query, starting after `continuation`.
    ///
    /// # Errors
    ///
    /// Returns `DocumentError::Backend` on store failure or a malformed
    /// continuation token.
    async fn query(
        &self,
        query: &DocumentQuery,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Page, DocumentError>;
}
