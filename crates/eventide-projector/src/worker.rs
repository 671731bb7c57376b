//! Wires the movie projection to PostgreSQL and runs one pipeline per lease.

use std::sync::Arc;

use eventide_core::clock::SystemClock;
use eventide_engine::event_log::EventLog;
use eventide_engine::pipeline::CatchUpPipeline;
use eventide_engine::reconciler::SnapshotReconciler;
use eventide_engine::snapshot_store::SnapshotStore;
use eventide_movies::domain::events::registry;
use eventide_movies::domain::projections::MovieProjection;
use eventide_postgres::{PgChangeFeed, PgDocumentStore, schema};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::ProjectorConfig;
use crate::error::AppError;

/// Container holding the event streams.
pub const EVENTS_CONTAINER: &str = "events";
/// Container holding the movie snapshots.
pub const SNAPSHOTS_CONTAINER: &str = "snapshots";

/// Connects to the database and provisions the schema.
///
/// # Errors
///
/// Returns `AppError::Database` if the connection or a schema statement
/// fails.
pub async fn connect(config: &ProjectorConfig) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    schema::ensure_schema(&pool).await?;
    Ok(pool)
}

/// Builds the movie catch-up pipeline over `pool`.
///
/// # Errors
///
/// Returns `AppError::Domain` if the event registry cannot be built.
pub fn movie_pipeline(
    pool: &PgPool,
    config: &ProjectorConfig,
) -> Result<CatchUpPipeline<MovieProjection>, AppError> {
    let registry = registry()?;
    let log = EventLog::new(
        Arc::new(PgDocumentStore::new(pool.clone(), EVENTS_CONTAINER)),
        Arc::clone(&registry),
        Arc::new(SystemClock),
    );
    let snapshots = SnapshotStore::new(Arc::new(PgDocumentStore::new(
        pool.clone(),
        SNAPSHOTS_CONTAINER,
    )));
    let reconciler = SnapshotReconciler::new(snapshots, log);
    Ok(CatchUpPipeline::new(Arc::new(reconciler), registry).with_options(config.pipeline))
}

/// Runs one pipeline task per lease until `cancel` fires, then waits for
/// every task to stop.
///
/// # Errors
///
/// Returns `AppError::Domain` if a lease cannot be opened and
/// `AppError::Task` if a pipeline task panicked.
#[instrument(skip_all, fields(processor = %config.processor, lease_count = config.lease_count))]
pub async fn run(
    pool: &PgPool,
    config: &ProjectorConfig,
    cancel: CancellationToken,
) -> Result<(), AppError> {
    let pipeline = Arc::new(movie_pipeline(pool, config)?);
    let feeds = PgChangeFeed::open_all(
        pool,
        EVENTS_CONTAINER,
        &config.processor,
        config.lease_count,
    )
    .await?;

    let handles: Vec<_> = feeds
        .into_iter()
        .map(|feed| Arc::clone(&pipeline).spawn(feed, cancel.clone()))
        .collect();
    info!(tasks = handles.len(), "pipelines started");

    for handle in handles {
        handle.await?;
    }
    info!("pipelines stopped");
    Ok(())
}
