//! Domain layer: events, projection and commands.

pub mod commands;
pub mod events;
pub mod projections;
