//! Catch-up projection of committed events into snapshots.
//!
//! The reconciler receives batches of committed events that may span several
//! streams and, across redeliveries, may repeat or arrive out of order. Each
//! affected snapshot is only ever advanced by a contiguous run of events
//! following its current revision.

use std::collections::BTreeMap;

use eventide_core::error::DomainError;
use eventide_core::event::Event;
use eventide_core::projection::Projection;
use tracing::{debug, error, info, instrument, warn};

use crate::event_log::EventLog;
use crate::options::ReconcilerOptions;
use crate::snapshot_store::{SnapshotStore, SnapshotUpdate};

/// What happened to one stream's snapshot during a reconcile call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The snapshot was folded forward and written.
    Advanced {
        /// First revision folded.
        from_revision: u64,
        /// Revision written.
        to_revision: u64,
    },
    /// The snapshot already reflected every event in the batch.
    Unchanged {
        /// The snapshot's revision.
        revision: u64,
    },
    /// Every attempt lost the write to a concurrent reconciler. The snapshot
    /// is left to the winner and to redelivery.
    Yielded {
        /// Revision the last attempt read.
        read_revision: u64,
    },
}

/// Per-stream results of one reconcile call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Outcome per stream id.
    pub outcomes: BTreeMap<String, StreamOutcome>,
}

impl ReconcileReport {
    /// Number of snapshots that were written.
    #[must_use]
    pub fn advanced(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, StreamOutcome::Advanced { .. }))
            .count()
    }

    /// Number of snapshots given up to a concurrent writer.
    #[must_use]
    pub fn yielded(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, StreamOutcome::Yielded { .. }))
            .count()
    }
}

/// Advances snapshots of projection `P` from batches of committed events.
#[derive(Debug)]
pub struct SnapshotReconciler<P: Projection> {
    snapshots: SnapshotStore<P>,
    log: EventLog<P::Event>,
    options: ReconcilerOptions,
}

impl<P: Projection> SnapshotReconciler<P> {
    /// Creates a reconciler writing to `snapshots` and repairing gaps from
    /// `log`.
    #[must_use]
    pub fn new(snapshots: SnapshotStore<P>, log: EventLog<P::Event>) -> Self {
        Self {
            snapshots,
            log,
            options: ReconcilerOptions::default(),
        }
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: ReconcilerOptions) -> Self {
        self.options = options;
        self
    }

    /// Applies a batch of committed events to the snapshots of every stream
    /// it touches. Streams are processed one after another.
    ///
    /// A lost conditional write re-reads the snapshot and folds again, up to
    /// `max_conflict_retries` times; after that the stream is reported as
    /// [`StreamOutcome::Yielded`] and is not an error.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Reconciliation` for the first stream whose
    /// snapshot cannot be read, folded or written. Streams earlier in the
    /// batch keep their writes; the caller must redeliver the whole batch.
    #[instrument(skip(self, events), fields(event_count = events.len()))]
    pub async fn reconcile(
        &self,
        events: Vec<Event<P::Event>>,
    ) -> Result<ReconcileReport, DomainError> {
        let mut by_stream: BTreeMap<String, Vec<Event<P::Event>>> = BTreeMap::new();
        for event in events {
            by_stream
                .entry(event.stream_id.clone())
                .or_default()
                .push(event);
        }

        let mut report = ReconcileReport::default();
        for (stream_id, stream_events) in by_stream {
            let outcome = self.reconcile_stream(&stream_id, &stream_events).await?;
            report.outcomes.insert(stream_id, outcome);
        }
        info!(
            streams = report.outcomes.len(),
            advanced = report.advanced(),
            yielded = report.yielded(),
            "batch reconciled"
        );
        Ok(report)
    }

    async fn reconcile_stream(
        &self,
        stream_id: &str,
        events: &[Event<P::Event>],
    ) -> Result<StreamOutcome, DomainError> {
        let partition_key = P::partition_key(stream_id);
        let mut attempt = 0;
        loop {
            let update = self
                .snapshots
                .advance(stream_id, &partition_key, events, &self.log)
                .await
                .map_err(|failed| {
                    error!(
                        stream_id,
                        from_revision = failed.from_revision,
                        to_revision = failed.to_revision,
                        error = %failed.source,
                        "snapshot reconciliation failed"
                    );
                    DomainError::Reconciliation {
                        stream_id: stream_id.to_owned(),
                        from_revision: failed.from_revision,
                        to_revision: failed.to_revision,
                        source: Box::new(failed.source),
                    }
                })?;

            match update {
                SnapshotUpdate::Advanced {
                    from_revision,
                    to_revision,
                } => {
                    return Ok(StreamOutcome::Advanced {
                        from_revision,
                        to_revision,
                    });
                }
                SnapshotUpdate::Unchanged { revision } => {
                    return Ok(StreamOutcome::Unchanged { revision });
                }
                SnapshotUpdate::Conflict { read_revision, .. }
                    if attempt >= self.options.max_conflict_retries =>
                {
                    warn!(
                        stream_id,
                        read_revision,
                        attempts = attempt + 1,
                        "snapshot kept changing concurrently; leaving it to redelivery"
                    );
                    return Ok(StreamOutcome::Yielded { read_revision });
                }
                SnapshotUpdate::Conflict { read_revision, .. } => {
                    attempt += 1;
                    debug!(stream_id, read_revision, attempt, "retrying after snapshot conflict");
                }
            }
        }
    }
}
