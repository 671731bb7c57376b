//! Authoritative read and write path: state is folded from the event log on
//! every call and never read from the snapshot table.

use eventide_core::error::DomainError;
use eventide_core::event::PendingEvent;
use eventide_core::projection::{Projection, Snapshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::event_log::EventLog;

/// Replays streams through projection `P`.
#[derive(Debug, Clone)]
pub struct EventRepository<P: Projection> {
    log: EventLog<P::Event>,
}

impl<P: Projection> EventRepository<P> {
    /// Creates a repository reading from and appending to `log`.
    #[must_use]
    pub fn new(log: EventLog<P::Event>) -> Self {
        Self { log }
    }

    /// Folds `stream_id` from its first event through `revision` (or the end
    /// of the stream when `None`).
    ///
    /// Returns `None` if the stream has no events, or if the folded state is
    /// soft-deleted and `include_deleted` is false.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Cancelled` if `cancel` fires during the replay
    /// and `DomainError::Infrastructure` or `DomainError::Validation` if the
    /// stream cannot be read or decoded.
    #[instrument(skip(self, cancel))]
    pub async fn get(
        &self,
        stream_id: &str,
        revision: Option<u64>,
        include_deleted: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Snapshot<P>>, DomainError> {
        let snapshot = self.fold(stream_id, revision, cancel).await?;
        if snapshot.is_new() || (snapshot.is_deleted() && !include_deleted) {
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    /// Appends `events` at `expected_revision` and returns the state folded
    /// through them. The snapshot table is not touched.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if the stream is not at
    /// `expected_revision`, plus any error of [`EventLog::append`].
    #[instrument(skip(self, events), fields(event_count = events.len()))]
    pub async fn apply_events(
        &self,
        stream_id: &str,
        expected_revision: u64,
        events: Vec<PendingEvent<P::Event>>,
    ) -> Result<Snapshot<P>, DomainError> {
        let mut snapshot = self
            .fold(stream_id, Some(expected_revision), &CancellationToken::new())
            .await?;
        if snapshot.revision != expected_revision {
            // The stream is shorter than the caller believes.
            return Err(DomainError::ConcurrencyConflict {
                stream_id: stream_id.to_owned(),
                expected: expected_revision,
                actual: snapshot.revision,
            });
        }
        let appended = self.log.append(stream_id, expected_revision, events).await?;
        snapshot.catch_up(&appended)?;
        debug!(revision = snapshot.revision, "state folded after append");
        Ok(snapshot)
    }

    async fn fold(
        &self,
        stream_id: &str,
        revision: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Snapshot<P>, DomainError> {
        let events = self.log.read_forward(stream_id, 0, revision, cancel).await?;
        let mut snapshot = Snapshot::for_stream(stream_id);
        snapshot.catch_up(&events)?;
        Ok(snapshot)
    }
}
