//! Eventide projector entry point.

use std::error::Error;

use eventide_projector::config::ProjectorConfig;
use eventide_projector::worker;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting Eventide projector");

    let config = ProjectorConfig::from_env()?;
    let pool = worker::connect(&config).await?;

    // Stop every pipeline on Ctrl-C.
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C; shutting down"),
        }
        shutdown.cancel();
    });

    worker::run(&pool, &config, cancel).await?;
    pool.close().await;

    tracing::info!("Eventide projector stopped");
    Ok(())
}
