//! Snapshot reads repaired with the event-log tail at query time.

use eventide_core::error::DomainError;
use eventide_core::projection::{Projection, Snapshot};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::event_log::EventLog;
use crate::snapshot_store::{SnapshotQuery, SnapshotStore};

/// Reads snapshots of `P` and folds the events the reconciler has not
/// applied yet, in memory. Nothing is written back.
#[derive(Debug)]
pub struct HybridReader<P: Projection> {
    snapshots: SnapshotStore<P>,
    log: EventLog<P::Event>,
}

impl<P: Projection> Clone for HybridReader<P> {
    fn clone(&self) -> Self {
        Self {
            snapshots: self.snapshots.clone(),
            log: self.log.clone(),
        }
    }
}

impl<P: Projection> HybridReader<P> {
    /// Creates a reader over `snapshots` that catches up from `log`.
    #[must_use]
    pub fn new(snapshots: SnapshotStore<P>, log: EventLog<P::Event>) -> Self {
        Self { snapshots, log }
    }

    /// Reads the snapshot of `stream_id` and folds every later event.
    ///
    /// The result is at least as recent as the stream was when the call
    /// began, whatever the reconciler's lag. Returns `None` if the stream has
    /// no events, or the caught-up state is soft-deleted and
    /// `include_deleted` is false.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Cancelled` if `cancel` fires while the tail is
    /// read, or any error reading the snapshot or the stream.
    #[instrument(skip(self, cancel))]
    pub async fn get_with_catchup(
        &self,
        stream_id: &str,
        partition_key: &str,
        include_deleted: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Snapshot<P>>, DomainError> {
        let snapshot = match self
            .snapshots
            .get_snapshot(stream_id, partition_key, true)
            .await?
        {
            Some(versioned) => versioned.value,
            None => Snapshot::empty(stream_id, partition_key),
        };
        let caught_up = catch_up(&self.log, snapshot, cancel).await?;
        Ok(visible(caught_up, include_deleted))
    }

    /// Runs a snapshot query and catches up every match individually.
    ///
    /// Filters and ordering apply to the stored snapshots, before catch-up.
    /// Meant for low-volume reads: each match costs one tail read.
    #[must_use]
    pub fn query_with_catchup(
        &self,
        partition_key: Option<&str>,
        shape: &SnapshotQuery,
        include_deleted: bool,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<Snapshot<P>, DomainError>> {
        let log = self.log.clone();
        self.snapshots
            .query_snapshots(partition_key, shape, include_deleted, cancel.clone())
            .try_filter_map(move |snapshot| {
                let log = log.clone();
                let cancel = cancel.clone();
                async move {
                    let caught_up = catch_up(&log, snapshot, &cancel).await?;
                    Ok(visible(caught_up, include_deleted))
                }
            })
            .boxed()
    }
}

async fn catch_up<P: Projection>(
    log: &EventLog<P::Event>,
    mut snapshot: Snapshot<P>,
    cancel: &CancellationToken,
) -> Result<Snapshot<P>, DomainError> {
    let tail = log
        .read_forward(&snapshot.id, snapshot.revision, None, cancel)
        .await?;
    if !tail.is_empty() {
        debug!(
            stream_id = %snapshot.id,
            from_revision = snapshot.revision + 1,
            event_count = tail.len(),
            "folding tail onto snapshot"
        );
        snapshot.catch_up(&tail)?;
    }
    Ok(snapshot)
}

fn visible<P: Projection>(snapshot: Snapshot<P>, include_deleted: bool) -> Option<Snapshot<P>> {
    if snapshot.is_new() || (snapshot.is_deleted() && !include_deleted) {
        None
    } else {
        Some(snapshot)
    }
}
