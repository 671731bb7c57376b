//! Eventide: Movie catalogue bounded context.
//!
//! Movies are created, renamed, rated and deleted through the event log. The
//! catalogue is read back either by replaying a movie's stream or from the
//! `MovieProjection` snapshots the projector keeps up to date.

pub mod application;
pub mod domain;

#[cfg(test)]
pub(crate) mod fixtures;
