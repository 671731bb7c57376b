//! Catch-up pipeline: change feed in, reconciled snapshots out.
//!
//! Each pipeline drives one change-feed lease. A batch is acknowledged only
//! after the reconciler has accepted all of it; a failed batch is left
//! unacknowledged so the feed delivers it again after `error_delay`.

use std::sync::Arc;
use std::time::Duration;

use eventide_core::change_feed::{ChangeBatch, ChangeFeed};
use eventide_core::error::DomainError;
use eventide_core::event::Event;
use eventide_core::projection::Projection;
use eventide_core::registry::EventTypeRegistry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::options::PipelineOptions;
use crate::reconciler::{ReconcileReport, SnapshotReconciler};

/// Result of one poll of the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The feed had nothing new.
    Idle,
    /// A batch was reconciled and acknowledged.
    Processed {
        /// Documents in the batch.
        documents: usize,
        /// Whether the batch hit the configured maximum size.
        full: bool,
        /// Per-stream outcomes.
        report: ReconcileReport,
    },
}

/// Feeds committed events of `P::Event` from a change feed into a
/// [`SnapshotReconciler`].
#[derive(Debug)]
pub struct CatchUpPipeline<P: Projection> {
    reconciler: Arc<SnapshotReconciler<P>>,
    registry: Arc<EventTypeRegistry<P::Event>>,
    options: PipelineOptions,
}

impl<P: Projection> Clone for CatchUpPipeline<P> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            registry: Arc::clone(&self.registry),
            options: self.options,
        }
    }
}

impl<P: Projection> CatchUpPipeline<P> {
    /// Creates a pipeline with default options.
    #[must_use]
    pub fn new(
        reconciler: Arc<SnapshotReconciler<P>>,
        registry: Arc<EventTypeRegistry<P::Event>>,
    ) -> Self {
        Self {
            reconciler,
            registry,
            options: PipelineOptions::default(),
        }
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Decodes every raw document of `batch` into a typed event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for an unregistered body type and
    /// `DomainError::Infrastructure` for a malformed record.
    pub fn convert(&self, batch: &ChangeBatch) -> Result<Vec<Event<P::Event>>, DomainError> {
        batch
            .documents
            .iter()
            .map(|document| self.registry.decode_document(document))
            .collect()
    }

    /// Decodes `batch` and hands it to the reconciler.
    ///
    /// # Errors
    ///
    /// Returns any error of [`Self::convert`] or
    /// [`SnapshotReconciler::reconcile`].
    pub async fn handle_batch(&self, batch: &ChangeBatch) -> Result<ReconcileReport, DomainError> {
        let events = self.convert(batch)?;
        self.reconciler.reconcile(events).await
    }

    /// Polls the feed once and processes what it returns.
    ///
    /// A full batch is held for `full_batch_delay` before it is
    /// acknowledged. A failed batch is held for `error_delay` and not
    /// acknowledged.
    ///
    /// # Errors
    ///
    /// Returns the batch's error after the error delay, or
    /// `DomainError::Cancelled` if `cancel` fires during a delay. In both
    /// cases the batch stays unacknowledged.
    #[instrument(skip(self, feed, cancel), fields(lease = feed.lease()))]
    pub async fn process_next<F: ChangeFeed + ?Sized>(
        &self,
        feed: &mut F,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, DomainError> {
        let batch = match feed.next_batch(self.options.max_batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "change feed read failed");
                pause(self.options.error_delay, cancel).await?;
                return Err(e);
            }
        };
        if batch.is_empty() {
            return Ok(StepOutcome::Idle);
        }

        let report = match self.handle_batch(&batch).await {
            Ok(report) => report,
            Err(e) => {
                error!(
                    documents = batch.len(),
                    delay_ms = duration_ms(self.options.error_delay),
                    error = %e,
                    "batch failed; it will be redelivered"
                );
                pause(self.options.error_delay, cancel).await?;
                return Err(e);
            }
        };

        let full = batch.len() >= self.options.max_batch_size;
        if full {
            debug!(
                delay_ms = duration_ms(self.options.full_batch_delay),
                "full batch; yielding before acknowledge"
            );
            pause(self.options.full_batch_delay, cancel).await?;
        }
        feed.acknowledge(&batch).await?;
        debug!(documents = batch.len(), cursor = batch.cursor.0, "batch acknowledged");
        Ok(StepOutcome::Processed {
            documents: batch.len(),
            full,
            report,
        })
    }

    /// Processes batches until `cancel` fires. Failed batches are logged
    /// and retried through redelivery; only cancellation ends the loop.
    pub async fn run<F: ChangeFeed + ?Sized>(&self, feed: &mut F, cancel: &CancellationToken) {
        info!(lease = feed.lease(), "catch-up pipeline started");
        while !cancel.is_cancelled() {
            match self.process_next(feed, cancel).await {
                Ok(StepOutcome::Idle) => {
                    if pause(self.options.idle_poll_interval, cancel).await.is_err() {
                        break;
                    }
                }
                Ok(StepOutcome::Processed { .. }) => {}
                Err(DomainError::Cancelled) => break,
                Err(e) => warn!(lease = feed.lease(), error = %e, "continuing after failed batch"),
            }
        }
        info!(lease = feed.lease(), "catch-up pipeline stopped");
    }

    /// Runs the pipeline on its own task, taking ownership of `feed`.
    #[must_use]
    pub fn spawn<F>(self: Arc<Self>, mut feed: F, cancel: CancellationToken) -> JoinHandle<()>
    where
        F: ChangeFeed + 'static,
    {
        tokio::spawn(async move { self.run(&mut feed, &cancel).await })
    }
}

async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), DomainError> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        () = cancel.cancelled() => Err(DomainError::Cancelled),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
