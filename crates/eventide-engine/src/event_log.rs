//! Append-only event log with optimistic concurrency.
//!
//! Each event is one document in the log's container, partitioned by stream
//! id and keyed by `(stream id, event number)`. An append conditionally
//! creates the slots `expected_revision + 1 ..` in a single per-partition
//! atomic write, so a second writer holding the same expected revision always
//! collides on the first slot and the whole batch is rejected.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use eventide_core::clock::Clock;
use eventide_core::document::{
    ContinuationToken, DocumentError, DocumentQuery, DocumentStore, FieldFilter, SortDirection,
};
use eventide_core::error::DomainError;
use eventide_core::event::{
    Event, EventBody, EventRecord, PendingEvent, event_document_id, fields, validate_stream_id,
};
use eventide_core::registry::EventTypeRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::options::EventLogOptions;

/// Source of the authoritative tail of a stream.
///
/// The reconciler falls back to it when a delivered batch is not a
/// contiguous continuation of the snapshot.
#[async_trait]
pub trait TailReader<E>: Send + Sync {
    /// Returns every event of `stream_id` numbered above `after_revision`,
    /// in ascending order.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the events cannot be read or decoded.
    async fn read_tail(&self, stream_id: &str, after_revision: u64)
    -> Result<Vec<Event<E>>, DomainError>;
}

/// The event log for streams whose events are of body type `E`.
pub struct EventLog<E> {
    store: Arc<dyn DocumentStore>,
    registry: Arc<EventTypeRegistry<E>>,
    clock: Arc<dyn Clock>,
    options: EventLogOptions,
}

impl<E> Clone for EventLog<E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            clock: Arc::clone(&self.clock),
            options: self.options,
        }
    }
}

impl<E> fmt::Debug for EventLog<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<E: EventBody> EventLog<E> {
    /// Creates an event log over `store` using default options.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<EventTypeRegistry<E>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            options: EventLogOptions::default(),
        }
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: EventLogOptions) -> Self {
        self.options = options;
        self
    }

    /// Appends `events` to `stream_id`, numbering them
    /// `expected_revision + 1 ..= expected_revision + events.len()`.
    ///
    /// Either every event is written or none is. Appending an empty batch is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the stream id is malformed, an
    /// event targets another stream, a body type is not registered, or a time
    /// to live reaches past the representable range.
    /// Returns `DomainError::ConcurrencyConflict` if the stream's revision is
    /// not `expected_revision`; the stream is left unchanged.
    #[instrument(skip(self, events), fields(event_count = events.len()))]
    pub async fn append(
        &self,
        stream_id: &str,
        expected_revision: u64,
        events: Vec<PendingEvent<E>>,
    ) -> Result<Vec<Event<E>>, DomainError> {
        validate_stream_id(stream_id)?;
        if let Some(foreign) = events.iter().find(|e| e.stream_id != stream_id) {
            return Err(DomainError::Validation(format!(
                "cannot append an event for stream {} to stream {stream_id}",
                foreign.stream_id
            )));
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        // A free slot after a missing one would open a gap, so the expected
        // head must exist before anything is written.
        if expected_revision > 0 {
            let head_id = event_document_id(stream_id, expected_revision);
            if self.store.read(stream_id, &head_id).await?.is_none() {
                return Err(self.conflict(stream_id, expected_revision).await);
            }
        }

        let timestamp = self.clock.now();
        let mut appended: Vec<Event<E>> = Vec::with_capacity(events.len());
        for (pending, event_number) in events.into_iter().zip(expected_revision + 1..) {
            let expires_at = pending
                .time_to_live
                .map(|ttl| {
                    timestamp.checked_add_signed(ttl).ok_or_else(|| {
                        DomainError::Validation(format!(
                            "time to live of event {event_number} is out of range"
                        ))
                    })
                })
                .transpose()?;
            appended.push(Event {
                event_id: Uuid::new_v4(),
                stream_id: stream_id.to_owned(),
                event_number,
                body: pending.body,
                timestamp,
                metadata: pending.metadata,
                expires_at,
            });
        }
        let documents = appended
            .iter()
            .map(|event| self.registry.encode_event(event))
            .collect::<Result<Vec<_>, _>>()?;

        match self.store.create_all_if_absent(stream_id, documents).await {
            Ok(_) => {
                debug!(
                    new_revision = expected_revision + appended.len() as u64,
                    "events appended"
                );
                Ok(appended)
            }
            Err(DocumentError::AlreadyExists { .. }) => {
                Err(self.conflict(stream_id, expected_revision).await)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn conflict(&self, stream_id: &str, expected: u64) -> DomainError {
        match self.revision(stream_id).await {
            Ok(actual) => {
                warn!(stream_id, expected, actual, "append rejected: stale expected revision");
                DomainError::ConcurrencyConflict {
                    stream_id: stream_id.to_owned(),
                    expected,
                    actual,
                }
            }
            Err(e) => e,
        }
    }

    /// Current revision of `stream_id`; `0` if the stream does not exist.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the store cannot be queried
    /// or holds a malformed record.
    pub async fn revision(&self, stream_id: &str) -> Result<u64, DomainError> {
        let query = DocumentQuery::new()
            .in_partition(stream_id)
            .order_by(fields::EVENT_NUMBER, SortDirection::Descending)
            .page_size(1);
        let page = self.store.query(&query, None).await?;
        match page.documents.first() {
            Some(head) => Ok(EventRecord::from_document(&head.value)?.event_number),
            None => Ok(0),
        }
    }

    /// Reads the events of `stream_id` numbered in
    /// `(from_revision_exclusive, to_revision_inclusive]`, ascending. `None`
    /// reads to the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Cancelled` if `cancel` fires between pages,
    /// `DomainError::Validation` for an unregistered body type and
    /// `DomainError::Infrastructure` on store or decoding failures.
    #[instrument(skip(self, cancel))]
    pub async fn read_forward(
        &self,
        stream_id: &str,
        from_revision_exclusive: u64,
        to_revision_inclusive: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Event<E>>, DomainError> {
        let mut query = DocumentQuery::new()
            .in_partition(stream_id)
            .filter(FieldFilter::gt(fields::EVENT_NUMBER, from_revision_exclusive))
            .order_by(fields::EVENT_NUMBER, SortDirection::Ascending)
            .page_size(self.options.page_size);
        if let Some(to) = to_revision_inclusive {
            query = query.filter(FieldFilter::lte(fields::EVENT_NUMBER, to));
        }

        let mut events = Vec::new();
        let mut continuation: Option<ContinuationToken> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(DomainError::Cancelled);
            }
            let page = self.store.query(&query, continuation.as_ref()).await?;
            for versioned in &page.documents {
                events.push(self.registry.decode_document(&versioned.value)?);
            }
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        debug!(event_count = events.len(), "stream read");
        Ok(events)
    }
}

#[async_trait]
impl<E: EventBody> TailReader<E> for EventLog<E> {
    async fn read_tail(
        &self,
        stream_id: &str,
        after_revision: u64,
    ) -> Result<Vec<Event<E>>, DomainError> {
        self.read_forward(stream_id, after_revision, None, &CancellationToken::new())
            .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use eventide_test_support::FailingDocumentStore;

    use super::*;
    use crate::fixtures::{Harness, TicketEvent, opened, retitled};

    #[tokio::test]
    async fn test_append_to_new_stream_numbers_from_one() {
        // Arrange
        let harness = Harness::new();

        // Act
        let appended = harness
            .log
            .append("t-1", 0, vec![opened("t-1", "Alien"), retitled("t-1", "Aliens")])
            .await
            .unwrap();

        // Assert
        let numbers: Vec<_> = appended.iter().map(|e| e.event_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert!(appended.iter().all(|e| e.timestamp == harness.clock.now()));
        assert_eq!(harness.log.revision("t-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_expected_revision_is_rejected_and_stream_unchanged() {
        // Arrange
        let harness = Harness::new();
        harness
            .log
            .append("t-1", 0, vec![opened("t-1", "Alien")])
            .await
            .unwrap();

        // Act
        let result = harness
            .log
            .append("t-1", 0, vec![retitled("t-1", "Hot Fuzz")])
            .await;

        // Assert
        match result {
            Err(DomainError::ConcurrencyConflict {
                stream_id,
                expected,
                actual,
            }) => {
                assert_eq!(stream_id, "t-1");
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected ConcurrencyConflict, got {other:?}"),
        }
        let events = harness
            .log
            .read_forward("t-1", 0, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0].body, TicketEvent::Opened(e) if e.title == "Alien"));
    }

    #[tokio::test]
    async fn test_expected_revision_ahead_of_stream_cannot_open_a_gap() {
        // Arrange
        let harness = Harness::new();
        harness
            .log
            .append("t-1", 0, vec![opened("t-1", "Alien")])
            .await
            .unwrap();

        // Act
        let result = harness
            .log
            .append("t-1", 5, vec![retitled("t-1", "Aliens")])
            .await;

        // Assert
        assert!(matches!(
            result,
            Err(DomainError::ConcurrencyConflict {
                expected: 5,
                actual: 1,
                ..
            })
        ));
        assert_eq!(harness.log.revision("t-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_partially_overlapping_batch_writes_nothing() {
        // Arrange
        let harness = Harness::new();
        harness
            .log
            .append("t-1", 0, vec![opened("t-1", "A"), retitled("t-1", "B")])
            .await
            .unwrap();

        // Act
        let result = harness
            .log
            .append(
                "t-1",
                1,
                vec![retitled("t-1", "C"), retitled("t-1", "D"), retitled("t-1", "E")],
            )
            .await;

        // Assert
        assert!(matches!(result, Err(DomainError::ConcurrencyConflict { actual: 2, .. })));
        assert_eq!(harness.log.revision("t-1").await.unwrap(), 2);
        assert!(harness.events.raw("t-1", "t-1|3").is_none());
    }

    #[tokio::test]
    async fn test_sequential_appends_are_gapless() {
        // Arrange
        let harness = Harness::new();

        // Act
        for revision in 0..5 {
            harness
                .log
                .append("t-1", revision, vec![retitled("t-1", &revision.to_string())])
                .await
                .unwrap();
        }

        // Assert
        let numbers: Vec<_> = harness
            .log
            .read_forward("t-1", 0, None, &CancellationToken::new())
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_mixed_stream_batch_is_a_validation_error() {
        let harness = Harness::new();

        let result = harness
            .log
            .append("t-1", 0, vec![opened("t-1", "A"), opened("t-2", "B")])
            .await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert_eq!(harness.log.revision("t-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_stream_id_is_a_validation_error() {
        let harness = Harness::new();

        let result = harness
            .log
            .append("t/1", 0, vec![opened("t/1", "A")])
            .await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unregistered_body_type_is_a_validation_error() {
        let harness = Harness::new();

        let result = harness
            .log
            .append("t-1", 0, vec![PendingEvent::new("t-1", TicketEvent::Unregistered)])
            .await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert!(harness.events.is_empty());
    }

    #[tokio::test]
    async fn test_append_empty_batch_is_noop() {
        let harness = Harness::new();

        let appended = harness.log.append("t-1", 0, vec![]).await.unwrap();

        assert!(appended.is_empty());
        assert!(harness.events.is_empty());
    }

    #[tokio::test]
    async fn test_read_forward_respects_range_across_pages() {
        // Arrange
        let harness = Harness::new();
        let log = harness.log.clone().with_options(EventLogOptions { page_size: 2 });
        let batch = (0..7).map(|n| retitled("t-1", &n.to_string())).collect();
        log.append("t-1", 0, batch).await.unwrap();

        // Act
        let events = log
            .read_forward("t-1", 2, Some(6), &CancellationToken::new())
            .await
            .unwrap();

        // Assert
        let numbers: Vec<_> = events.iter().map(|e| e.event_number).collect();
        assert_eq!(numbers, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_read_forward_observes_cancellation() {
        let harness = Harness::new();
        harness
            .log
            .append("t-1", 0, vec![opened("t-1", "A")])
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = harness.log.read_forward("t-1", 0, None, &cancel).await;

        assert!(matches!(result, Err(DomainError::Cancelled)));
    }

    #[tokio::test]
    async fn test_metadata_and_time_to_live_are_persisted() {
        // Arrange
        let harness = Harness::new();
        let pending = opened("t-1", "A")
            .with_metadata("correlation", "req-42")
            .with_time_to_live(Duration::days(30));

        // Act
        harness.log.append("t-1", 0, vec![pending]).await.unwrap();

        // Assert
        let events = harness
            .log
            .read_forward("t-1", 0, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(events[0].metadata["correlation"], "req-42");
        assert_eq!(
            events[0].expires_at,
            Some(harness.clock.now() + Duration::days(30))
        );
    }

    #[tokio::test]
    async fn test_time_to_live_overflow_is_a_validation_error() {
        // Arrange
        let harness = Harness::new();
        let pending = opened("t-1", "A").with_time_to_live(Duration::MAX);

        // Act
        let result = harness.log.append("t-1", 0, vec![pending]).await;

        // Assert
        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert!(harness.events.is_empty());
        assert_eq!(harness.log.revision("t-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_appends_at_same_revision_admit_one_writer() {
        // Arrange
        let harness = Harness::new();
        harness
            .log
            .append("t-1", 0, vec![opened("t-1", "A")])
            .await
            .unwrap();
        let first = harness.log.clone();
        let second = harness.log.clone();

        // Act
        let a = tokio::spawn(async move {
            first
                .append("t-1", 1, vec![retitled("t-1", "B"), retitled("t-1", "C")])
                .await
        });
        let b = tokio::spawn(async move {
            second.append("t-1", 1, vec![retitled("t-1", "D")]).await
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        // Assert
        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(DomainError::ConcurrencyConflict { expected: 1, .. })
        )));
        let numbers: Vec<_> = harness
            .log
            .read_forward("t-1", 0, None, &CancellationToken::new())
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_number)
            .collect();
        let revision = 1 + winners[0].len() as u64;
        assert_eq!(numbers, (1..=revision).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_infrastructure_error() {
        let log = EventLog::new(
            Arc::new(FailingDocumentStore),
            crate::fixtures::registry(),
            Arc::new(eventide_core::clock::SystemClock),
        );

        let result = log.append("t-1", 0, vec![opened("t-1", "A")]).await;

        assert!(matches!(result, Err(DomainError::Infrastructure(_))));
    }
}
