//! Tuning knobs for the engine components.

use std::time::Duration;

/// Options for [`crate::event_log::EventLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLogOptions {
    /// Events fetched per page when reading a stream.
    pub page_size: usize,
}

impl Default for EventLogOptions {
    fn default() -> Self {
        Self { page_size: 100 }
    }
}

/// Options for [`crate::reconciler::SnapshotReconciler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerOptions {
    /// How often a stream is re-read and re-folded after losing a snapshot
    /// write to a concurrent reconciler before the batch yields to
    /// redelivery.
    pub max_conflict_retries: u32,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
        }
    }
}

/// Options for [`crate::pipeline::CatchUpPipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Maximum documents requested from the change feed per batch.
    pub max_batch_size: usize,
    /// Pause before acknowledging a full batch, so one lease catching up on a
    /// backlog does not starve the others.
    pub full_batch_delay: Duration,
    /// Pause after a failed batch before it is redelivered.
    pub error_delay: Duration,
    /// Pause between polls when the feed is caught up.
    pub idle_poll_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            full_batch_delay: Duration::from_millis(500),
            error_delay: Duration::from_secs(5),
            idle_poll_interval: Duration::from_secs(1),
        }
    }
}
