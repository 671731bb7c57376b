//! Materialized snapshot table.
//!
//! One document per stream, partitioned by the projection's grouping key so
//! whole partitions can be listed. Snapshots lag the event log; they are only
//! written by the reconciler, each write conditioned on the version token the
//! writer read.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use eventide_core::document::{
    ContinuationToken, DocumentError, DocumentQuery, DocumentStore, FieldFilter, FilterOp,
    SortDirection, SortOrder, Versioned,
};
use eventide_core::error::DomainError;
use eventide_core::event::Event;
use eventide_core::projection::{Projection, Snapshot, fields};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::event_log::TailReader;

/// Shape of a bulk snapshot query over projection fields.
///
/// Field names refer to the projection's own state; they are resolved
/// against the persisted snapshot layout internally.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotQuery {
    filters: Vec<FieldFilter>,
    order_by: Option<SortOrder>,
    page_size: usize,
}

impl Default for SnapshotQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            order_by: None,
            page_size: 100,
        }
    }
}

impl SnapshotQuery {
    /// Matches every snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate on a projection field.
    #[must_use]
    pub fn filter(mut self, field: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters
            .push(FieldFilter::new(state_field(field), op, value.into()));
        self
    }

    /// Orders results by a projection field.
    #[must_use]
    pub fn order_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.order_by = Some(SortOrder {
            field: state_field(field),
            direction,
        });
        self
    }

    /// Snapshots fetched per page.
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn to_document_query(&self, partition_key: Option<&str>, include_deleted: bool) -> DocumentQuery {
        let mut query = DocumentQuery {
            partition_key: partition_key.map(str::to_owned),
            filters: self.filters.clone(),
            order_by: self.order_by.clone(),
            page_size: self.page_size,
        };
        if !include_deleted {
            query = query.filter(FieldFilter::is_null(fields::DELETED_AT));
        }
        query
    }
}

fn state_field(field: &str) -> String {
    format!("{}.{field}", fields::STATE)
}

/// Result of one attempt to advance a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotUpdate {
    /// Nothing newer than the snapshot's revision was found.
    Unchanged {
        /// The snapshot's revision.
        revision: u64,
    },
    /// The snapshot was advanced and written.
    Advanced {
        /// First revision folded.
        from_revision: u64,
        /// Revision written.
        to_revision: u64,
    },
    /// Another writer changed the snapshot between our read and our write;
    /// nothing was written.
    Conflict {
        /// Revision the snapshot had when it was read.
        read_revision: u64,
        /// Revision we tried to write.
        attempted_revision: u64,
    },
}

/// An advance that failed, with the revisions it was folding.
#[derive(Debug)]
pub(crate) struct FailedAttempt {
    pub from_revision: u64,
    pub to_revision: u64,
    pub source: DomainError,
}

impl FailedAttempt {
    /// Failure before the snapshot was read; only the batch bounds are known.
    fn over_batch<E>(events: &[Event<E>], source: DomainError) -> Self {
        let numbers = events.iter().map(|e| e.event_number);
        Self {
            from_revision: numbers.clone().min().unwrap_or(0),
            to_revision: numbers.max().unwrap_or(0),
            source,
        }
    }
}

/// Snapshot store for projection `P`.
pub struct SnapshotStore<P> {
    store: Arc<dyn DocumentStore>,
    _projection: PhantomData<fn() -> P>,
}

impl<P> Clone for SnapshotStore<P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _projection: PhantomData,
        }
    }
}

impl<P> fmt::Debug for SnapshotStore<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("projection", &std::any::type_name::<P>())
            .finish_non_exhaustive()
    }
}

impl<P: Projection> SnapshotStore<P> {
    /// Creates a snapshot store over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            _projection: PhantomData,
        }
    }

    /// Point read of one snapshot together with its version token.
    ///
    /// Returns `None` if the snapshot does not exist, or is soft-deleted and
    /// `include_deleted` is false.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on store failure or a malformed
    /// document.
    pub async fn get_snapshot(
        &self,
        id: &str,
        partition_key: &str,
        include_deleted: bool,
    ) -> Result<Option<Versioned<Snapshot<P>>>, DomainError> {
        let Some(versioned) = self.store.read(partition_key, id).await? else {
            return Ok(None);
        };
        let snapshot = Snapshot::<P>::from_document(&versioned.value)?;
        if snapshot.is_deleted() && !include_deleted {
            return Ok(None);
        }
        Ok(Some(Versioned {
            value: snapshot,
            token: versioned.token,
        }))
    }

    /// Lazily queries snapshots in `partition_key` (or every partition),
    /// fetching one page per poll.
    ///
    /// The stream is finite and not restartable. It checks `cancel` before
    /// each page and ends with `DomainError::Cancelled` if it fired.
    #[must_use]
    pub fn query_snapshots(
        &self,
        partition_key: Option<&str>,
        shape: &SnapshotQuery,
        include_deleted: bool,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<Snapshot<P>, DomainError>> {
        let store = Arc::clone(&self.store);
        let query = Arc::new(shape.to_document_query(partition_key, include_deleted));

        // `None` once the last page has been fetched; `Some(None)` before the
        // first one.
        let start: Option<Option<ContinuationToken>> = Some(None);
        let pages = stream::try_unfold(start, move |state| {
            let store = Arc::clone(&store);
            let query = Arc::clone(&query);
            let cancel = cancel.clone();
            async move {
                let Some(continuation) = state else {
                    return Ok(None);
                };
                if cancel.is_cancelled() {
                    return Err(DomainError::Cancelled);
                }
                let page = store.query(&query, continuation.as_ref()).await?;
                let snapshots = page
                    .documents
                    .iter()
                    .map(|v| Snapshot::<P>::from_document(&v.value))
                    .collect::<Result<Vec<_>, _>>()?;
                debug!(count = snapshots.len(), "snapshot page fetched");
                Ok(Some((snapshots, page.continuation.map(Some))))
            }
        });

        pages
            .map_ok(|snapshots| stream::iter(snapshots.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    /// Advances the snapshot of `stream_id` with a batch of committed events.
    ///
    /// Events already reflected in the snapshot are skipped. If what remains
    /// is not a gapless continuation of the snapshot's revision, the batch is
    /// discarded and the authoritative tail is read from `tail` instead. The
    /// result is written conditioned on the token that was read; losing that
    /// race yields [`SnapshotUpdate::Conflict`] rather than an error.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the snapshot or tail cannot be read, the
    /// events cannot be folded, or the write fails for a reason other than a
    /// concurrent modification.
    pub async fn apply_events_to_snapshot(
        &self,
        stream_id: &str,
        partition_key: &str,
        events: &[Event<P::Event>],
        tail: &dyn TailReader<P::Event>,
    ) -> Result<SnapshotUpdate, DomainError> {
        self.advance(stream_id, partition_key, events, tail)
            .await
            .map_err(|failed| failed.source)
    }

    #[instrument(skip(self, events, tail), fields(event_count = events.len()))]
    pub(crate) async fn advance(
        &self,
        stream_id: &str,
        partition_key: &str,
        events: &[Event<P::Event>],
        tail: &dyn TailReader<P::Event>,
    ) -> Result<SnapshotUpdate, FailedAttempt> {
        let (mut snapshot, token) = match self
            .get_snapshot(stream_id, partition_key, true)
            .await
            .map_err(|source| FailedAttempt::over_batch(events, source))?
        {
            Some(versioned) => (versioned.value, Some(versioned.token)),
            None => (Snapshot::empty(stream_id, partition_key), None),
        };
        let read_revision = snapshot.revision;
        let failed = move |to_revision: u64| {
            move |source: DomainError| FailedAttempt {
                from_revision: read_revision + 1,
                to_revision,
                source,
            }
        };

        let mut pending: Vec<&Event<P::Event>> = events
            .iter()
            .filter(|e| e.stream_id == stream_id && e.event_number > read_revision)
            .collect();
        pending.sort_by_key(|e| e.event_number);
        pending.dedup_by_key(|e| e.event_number);

        let Some(batch_last) = pending.last().map(|e| e.event_number) else {
            debug!(revision = read_revision, "batch already reflected in snapshot");
            return Ok(SnapshotUpdate::Unchanged {
                revision: read_revision,
            });
        };
        let contiguous = pending[0].event_number == read_revision + 1
            && batch_last == read_revision + pending.len() as u64;

        let fetched;
        let to_fold: Vec<&Event<P::Event>> = if contiguous {
            pending
        } else {
            warn!(
                revision = read_revision,
                batch_first = pending[0].event_number,
                batch_last,
                "batch is not contiguous with snapshot; reading tail from event log"
            );
            fetched = tail
                .read_tail(stream_id, read_revision)
                .await
                .map_err(failed(batch_last))?;
            fetched.iter().collect()
        };
        let attempted_to = to_fold
            .last()
            .map_or(batch_last, |e| e.event_number.max(batch_last));

        snapshot.catch_up(to_fold).map_err(failed(attempted_to))?;
        if snapshot.revision == read_revision {
            return Ok(SnapshotUpdate::Unchanged {
                revision: read_revision,
            });
        }

        let document = snapshot.to_document().map_err(failed(snapshot.revision))?;
        let written = match &token {
            Some(token) => self.store.upsert(document, Some(token)).await,
            None => self.store.create_if_absent(document).await,
        };
        match written {
            Ok(_) => {
                debug!(
                    from_revision = read_revision + 1,
                    to_revision = snapshot.revision,
                    "snapshot advanced"
                );
                Ok(SnapshotUpdate::Advanced {
                    from_revision: read_revision + 1,
                    to_revision: snapshot.revision,
                })
            }
            Err(DocumentError::TokenMismatch { .. } | DocumentError::AlreadyExists { .. }) => {
                debug!(
                    read_revision,
                    attempted_revision = snapshot.revision,
                    "snapshot changed concurrently"
                );
                Ok(SnapshotUpdate::Conflict {
                    read_revision,
                    attempted_revision: snapshot.revision,
                })
            }
            Err(e) => Err(failed(snapshot.revision)(e.into())),
        }
    }
}
