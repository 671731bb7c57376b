//! Eventide projector: keeps movie snapshots in step with the event log.
//!
//! One catch-up pipeline runs per lease range of the events container, each
//! reading the PostgreSQL change feed and reconciling the movie snapshots.

pub mod config;
pub mod error;
pub mod worker;
