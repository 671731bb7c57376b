//! Eventide Engine: the event log and its materialized snapshots.
//!
//! Writes go to the [`event_log::EventLog`], which numbers events per stream
//! and rejects stale writers. Reads can replay a stream on demand through the
//! [`repository::EventRepository`], read the lag-tolerant
//! [`snapshot_store::SnapshotStore`], or combine both through the
//! [`hybrid::HybridReader`]. The [`pipeline::CatchUpPipeline`] feeds committed
//! events from a change feed into the [`reconciler::SnapshotReconciler`],
//! which keeps snapshots eventually consistent with the log.

pub mod event_log;
pub mod hybrid;
pub mod options;
pub mod pipeline;
pub mod reconciler;
pub mod repository;
pub mod snapshot_store;

#[cfg(test)]
pub(crate) mod fixtures;
