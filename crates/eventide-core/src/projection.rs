//! Projection and snapshot model.
//!
//! A projection is the fold of a stream's events into queryable state. A
//! [`Snapshot`] wraps that state with the revision it has been folded
//! through, its partition key and the soft-delete marker.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::DomainError;
use crate::event::{Event, EventBody};

/// Information derived from the event being applied that is not part of its
/// body.
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    /// Stream the event belongs to.
    pub stream_id: &'a str,
    /// Number assigned to the event on append.
    pub event_number: u64,
    /// Commit timestamp of the event.
    pub timestamp: DateTime<Utc>,
}

impl<'a, E> From<&'a Event<E>> for ApplyContext<'a> {
    fn from(event: &'a Event<E>) -> Self {
        Self {
            stream_id: &event.stream_id,
            event_number: event.event_number,
            timestamp: event.timestamp,
        }
    }
}

/// Materialized state of one stream.
///
/// `apply` must be a pure function of the current state, the event, and its
/// context: folding the same events in the same order must always produce the
/// same state.
pub trait Projection:
    Default + Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The event sum type this projection folds.
    type Event: EventBody;

    /// Grouping key for bulk queries over snapshots of this projection.
    fn partition_key(stream_id: &str) -> String;

    /// Folds one event into the state.
    fn apply(&mut self, event: &Self::Event, context: &ApplyContext<'_>);

    /// Returns `true` if the event soft-deletes the entity.
    fn is_deletion(_event: &Self::Event) -> bool {
        false
    }
}

/// Field names of the persisted snapshot document.
pub mod fields {
    /// `revision`
    pub const REVISION: &str = "revision";
    /// `deletedAt`
    pub const DELETED_AT: &str = "deletedAt";
    /// Prefix of projection-specific fields.
    pub const STATE: &str = "state";
}

/// A projection's state together with its bookkeeping fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "P: Projection")]
pub struct Snapshot<P> {
    /// Stream id, also the document id.
    pub id: String,
    /// Partition the snapshot document lives in.
    pub partition_key: String,
    /// Number of the last event folded into `state`.
    pub revision: u64,
    /// Set by a deletion event; the snapshot itself is never removed.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Projection-specific state.
    pub state: P,
}

impl<P: Projection> Snapshot<P> {
    /// A zero-revision snapshot with default state.
    #[must_use]
    pub fn empty(id: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            partition_key: partition_key.into(),
            revision: 0,
            deleted_at: None,
            state: P::default(),
        }
    }

    /// A zero-revision snapshot in the projection's default partition.
    #[must_use]
    pub fn for_stream(stream_id: &str) -> Self {
        Self::empty(stream_id, P::partition_key(stream_id))
    }

    /// Returns `true` if a deletion event has been folded.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns `true` if no event has been folded yet.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.revision == 0
    }

    /// Folds the next event of the stream.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the event belongs to another
    /// stream or is not exactly `revision + 1`; the snapshot is unchanged.
    pub fn fold(&mut self, event: &Event<P::Event>) -> Result<(), DomainError> {
        if event.stream_id != self.id {
            return Err(DomainError::Validation(format!(
                "event {} of stream {} cannot be folded into snapshot {}",
                event.event_number, event.stream_id, self.id
            )));
        }
        if event.event_number != self.revision + 1 {
            return Err(DomainError::Validation(format!(
                "snapshot {} is at revision {} and cannot fold event {}",
                self.id, self.revision, event.event_number
            )));
        }
        self.state.apply(&event.body, &ApplyContext::from(event));
        if P::is_deletion(&event.body) {
            self.deleted_at = Some(event.timestamp);
        }
        self.revision = event.event_number;
        Ok(())
    }

    /// Folds every event newer than `revision`, skipping ones already
    /// applied. Returns the number of events folded.
    ///
    /// # Errors
    ///
    /// Returns the first [`Self::fold`] error; events before it stay folded.
    pub fn catch_up<'a, I>(&mut self, events: I) -> Result<usize, DomainError>
    where
        I: IntoIterator<Item = &'a Event<P::Event>>,
    {
        let mut folded = 0;
        for event in events {
            if event.event_number <= self.revision {
                continue;
            }
            self.fold(event)?;
            folded += 1;
        }
        Ok(folded)
    }

    /// Serializes the snapshot into its document.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the state does not serialize.
    pub fn to_document(&self) -> Result<Document, DomainError> {
        Ok(Document::new(
            self.partition_key.clone(),
            self.id.clone(),
            serde_json::to_value(self)?,
        ))
    }

    /// Reads a snapshot back from its document.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the body does not match.
    pub fn from_document(document: &Document) -> Result<Self, DomainError> {
        Self::deserialize(&document.body).map_err(|e| {
            DomainError::Infrastructure(format!(
                "document {}/{} is not a snapshot: {e}",
                document.partition_key, document.id
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use uuid::Uuid;

    use super::*;
    use crate::event::EventMetadata;

    #[derive(Debug, Clone, PartialEq)]
    enum TallyEvent {
        Added(u32),
        Closed,
    }

    impl EventBody for TallyEvent {
        fn type_name(&self) -> &'static str {
            match self {
                Self::Added(_) => "tally.added",
                Self::Closed => "tally.closed",
            }
        }

        fn to_payload(&self) -> Result<Value, serde_json::Error> {
            match self {
                Self::Added(n) => Ok(json!({ "amount": n })),
                Self::Closed => Ok(json!({})),
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tally {
        total: u32,
        last_event: u64,
    }

    impl Projection for Tally {
        type Event = TallyEvent;

        fn partition_key(_stream_id: &str) -> String {
            "tallies".to_owned()
        }

        fn apply(&mut self, event: &TallyEvent, context: &ApplyContext<'_>) {
            if let TallyEvent::Added(n) = event {
                self.total += n;
            }
            self.last_event = context.event_number;
        }

        fn is_deletion(event: &TallyEvent) -> bool {
            matches!(event, TallyEvent::Closed)
        }
    }

    fn event(number: u64, body: TallyEvent) -> Event<TallyEvent> {
        Event {
            event_id: Uuid::new_v4(),
            stream_id: "t-1".to_owned(),
            event_number: number,
            body,
            timestamp: Utc::now(),
            metadata: EventMetadata::new(),
            expires_at: None,
        }
    }

    #[test]
    fn test_fold_advances_revision_and_passes_context() {
        let mut snapshot = Snapshot::<Tally>::for_stream("t-1");

        snapshot.fold(&event(1, TallyEvent::Added(5))).unwrap();

        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.partition_key, "tallies");
        assert_eq!(snapshot.state.total, 5);
        assert_eq!(snapshot.state.last_event, 1);
    }

    #[test]
    fn test_fold_rejects_non_contiguous_event() {
        let mut snapshot = Snapshot::<Tally>::for_stream("t-1");

        let result = snapshot.fold(&event(2, TallyEvent::Added(5)));

        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert_eq!(snapshot.revision, 0);
        assert_eq!(snapshot.state.total, 0);
    }

    #[test]
    fn test_fold_rejects_foreign_stream() {
        let mut snapshot = Snapshot::<Tally>::for_stream("t-2");

        let result = snapshot.fold(&event(1, TallyEvent::Added(5)));

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_catch_up_skips_already_applied_events() {
        let mut snapshot = Snapshot::<Tally>::for_stream("t-1");
        let events = vec![
            event(1, TallyEvent::Added(1)),
            event(2, TallyEvent::Added(2)),
        ];
        snapshot.catch_up(&events).unwrap();

        let folded = snapshot.catch_up(&events).unwrap();

        assert_eq!(folded, 0);
        assert_eq!(snapshot.state.total, 3);
        assert_eq!(snapshot.revision, 2);
    }

    #[test]
    fn test_deletion_event_sets_deleted_at() {
        let mut snapshot = Snapshot::<Tally>::for_stream("t-1");
        let closed = event(1, TallyEvent::Closed);

        snapshot.fold(&closed).unwrap();

        assert!(snapshot.is_deleted());
        assert_eq!(snapshot.deleted_at, Some(closed.timestamp));
    }

    #[test]
    fn test_document_layout_nests_state() {
        let mut snapshot = Snapshot::<Tally>::for_stream("t-1");
        snapshot.fold(&event(1, TallyEvent::Added(5))).unwrap();

        let document = snapshot.to_document().unwrap();

        assert_eq!(document.partition_key, "tallies");
        assert_eq!(document.id, "t-1");
        assert_eq!(document.body["revision"], json!(1));
        assert_eq!(document.body["deletedAt"], Value::Null);
        assert_eq!(document.body["state"]["total"], json!(5));
        assert_eq!(Snapshot::<Tally>::from_document(&document).unwrap(), snapshot);
    }
}
