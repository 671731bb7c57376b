//! Projector error types.

use eventide_core::error::DomainError;
use thiserror::Error;

/// Startup and runtime errors for the projector.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection, pool or schema error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Registry setup or change feed error.
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),

    /// A pipeline task panicked or was aborted.
    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
