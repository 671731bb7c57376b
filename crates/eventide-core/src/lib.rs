//! Eventide Core: shared abstractions.
//!
//! This crate defines the types and contracts every other crate depends on:
//! the event envelope and type registry, the projection and snapshot model,
//! and the collaborator contracts for the partitioned document store and the
//! change feed. It contains no infrastructure code.

pub mod change_feed;
pub mod clock;
pub mod document;
pub mod error;
pub mod event;
pub mod projection;
pub mod registry;
