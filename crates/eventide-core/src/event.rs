//! Event envelope and persisted event record.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::document::Document;
use crate::error::DomainError;

/// Free-form string metadata attached to an event.
pub type EventMetadata = BTreeMap<String, String>;

/// Trait implemented by the sum type of every concrete event a stream can
/// carry.
pub trait EventBody: fmt::Debug + Clone + Send + Sync + 'static {
    /// Stable type name persisted with the event (the registry key).
    fn type_name(&self) -> &'static str;

    /// Serializes the concrete event's fields, without the type tag.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error.
    fn to_payload(&self) -> Result<Value, serde_json::Error>;
}

/// An event that has not been appended yet and therefore has no number.
#[derive(Debug, Clone)]
pub struct PendingEvent<E> {
    /// Stream the event is destined for.
    pub stream_id: String,
    /// Event body.
    pub body: E,
    /// Free-form metadata.
    pub metadata: EventMetadata,
    /// Optional lifetime of the stored event record.
    pub time_to_live: Option<Duration>,
}

impl<E> PendingEvent<E> {
    /// Creates a pending event without metadata or expiry.
    #[must_use]
    pub fn new(stream_id: impl Into<String>, body: E) -> Self {
        Self {
            stream_id: stream_id.into(),
            body,
            metadata: EventMetadata::new(),
            time_to_live: None,
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Lets the stored record expire `ttl` after it is committed.
    #[must_use]
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// An appended, immutable event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    /// Globally unique event identifier.
    pub event_id: Uuid,
    /// Stream this event belongs to.
    pub stream_id: String,
    /// Position within the stream, starting at 1.
    pub event_number: u64,
    /// Event body.
    pub body: E,
    /// Commit timestamp.
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata.
    pub metadata: EventMetadata,
    /// Expiry of the stored record, if any.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Persisted layout of an event document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Globally unique event identifier.
    pub event_id: Uuid,
    /// Stream (and partition key) of the event.
    pub stream_id: String,
    /// Position within the stream.
    pub event_number: u64,
    /// Registry key of the body.
    pub body_type: String,
    /// Serialized body.
    pub body: Value,
    /// Commit timestamp.
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: EventMetadata,
}

/// Field names of [`EventRecord`] used in queries.
pub mod fields {
    /// `eventNumber`
    pub const EVENT_NUMBER: &str = "eventNumber";
    /// `streamId`
    pub const STREAM_ID: &str = "streamId";
}

/// Document id of event `event_number` in `stream_id`.
#[must_use]
pub fn event_document_id(stream_id: &str, event_number: u64) -> String {
    format!("{stream_id}|{event_number}")
}

/// Rejects stream ids that cannot be used as partition keys or document ids.
///
/// # Errors
///
/// Returns `DomainError::Validation` for empty, over-long, or reserved
/// characters.
pub fn validate_stream_id(stream_id: &str) -> Result<(), DomainError> {
    const MAX_LEN: usize = 255;
    const RESERVED: [char; 5] = ['/', '\\', '?', '#', '|'];

    if stream_id.is_empty() {
        return Err(DomainError::Validation("stream id must not be empty".into()));
    }
    if stream_id.len() > MAX_LEN {
        return Err(DomainError::Validation(format!(
            "stream id exceeds {MAX_LEN} bytes"
        )));
    }
    if let Some(c) = stream_id
        .chars()
        .find(|c| RESERVED.contains(c) || c.is_control())
    {
        return Err(DomainError::Validation(format!(
            "stream id {stream_id:?} contains reserved character {c:?}"
        )));
    }
    Ok(())
}

impl EventRecord {
    /// Wraps the record in a document partitioned by stream id.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error.
    pub fn into_document(
        self,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Document, serde_json::Error> {
        let partition_key = self.stream_id.clone();
        let id = event_document_id(&self.stream_id, self.event_number);
        let body = serde_json::to_value(self)?;
        Ok(Document {
            partition_key,
            id,
            body,
            expires_at,
        })
    }

    /// Reads a record back from its document.
    ///
    /// # Errors
    ///
    /// Returns the deserializer's error if the body is not an event record.
    pub fn from_document(document: &Document) -> Result<Self, serde_json::Error> {
        Self::deserialize(&document.body)
    }
}
