//! Projector configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;

use eventide_engine::options::PipelineOptions;

use crate::error::AppError;

/// Everything the projector needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectorConfig {
    /// `PostgreSQL` connection string.
    pub database_url: String,
    /// Processor name; leases and cursors are kept per name.
    pub processor: String,
    /// Number of lease ranges, one pipeline task each.
    pub lease_count: u32,
    /// Connection pool size.
    pub max_connections: u32,
    /// Batch size and pacing of every pipeline.
    pub pipeline: PipelineOptions,
}

impl ProjectorConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `DATABASE_URL` is unset or a variable
    /// does not parse.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `DATABASE_URL` is missing or a variable
    /// does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let database_url = lookup("DATABASE_URL").ok_or_else(|| {
            AppError::Config("DATABASE_URL environment variable must be set".into())
        })?;
        let defaults = PipelineOptions::default();

        let lease_count: u32 = parse(&lookup, "PROJECTOR_LEASE_COUNT", 1)?;
        if lease_count == 0 {
            return Err(AppError::Config(
                "PROJECTOR_LEASE_COUNT must be at least 1".into(),
            ));
        }
        let max_batch_size: usize =
            parse(&lookup, "PROJECTOR_MAX_BATCH_SIZE", defaults.max_batch_size)?;
        if max_batch_size == 0 {
            return Err(AppError::Config(
                "PROJECTOR_MAX_BATCH_SIZE must be at least 1".into(),
            ));
        }

        Ok(Self {
            database_url,
            processor: lookup("PROJECTOR_NAME").unwrap_or_else(|| "movie-projector".to_owned()),
            lease_count,
            // Every lease holds a connection while polling.
            max_connections: parse(
                &lookup,
                "PROJECTOR_MAX_CONNECTIONS",
                lease_count.saturating_add(2),
            )?,
            pipeline: PipelineOptions {
                max_batch_size,
                full_batch_delay: millis(
                    &lookup,
                    "PROJECTOR_FULL_BATCH_DELAY_MS",
                    defaults.full_batch_delay,
                )?,
                error_delay: millis(&lookup, "PROJECTOR_ERROR_DELAY_MS", defaults.error_delay)?,
                idle_poll_interval: millis(
                    &lookup,
                    "PROJECTOR_POLL_INTERVAL_MS",
                    defaults.idle_poll_interval,
                )?,
            },
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{key} must be a valid number: {e}"))),
        None => Ok(default),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, AppError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse(lookup, key, default_ms).map(Duration::from_millis)
}
