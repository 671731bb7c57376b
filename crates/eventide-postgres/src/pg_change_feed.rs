//! Polling change feed over the documents table.
//!
//! Writes clear a document's `feed_position`. Before each poll the feed
//! stamps unstamped documents with positions from a sequence, holding a
//! per-container advisory lock so stamps become visible in position order.
//! Partitions are split into `lease_count` disjoint ranges by hash of the
//! partition key; each feed owns one range and persists its cursor in
//! `change_feed_leases` only when a batch is acknowledged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument};

use eventide_core::change_feed::{ChangeBatch, ChangeFeed, FeedCursor};
use eventide_core::document::Document;
use eventide_core::error::DomainError;

/// Upper bound of documents stamped per poll.
const STAMP_LIMIT: i64 = 1000;

fn infrastructure(err: sqlx::Error) -> DomainError {
    DomainError::Infrastructure(err.to_string())
}

fn to_i64(cursor: FeedCursor) -> Result<i64, DomainError> {
    i64::try_from(cursor.0)
        .map_err(|_| DomainError::Infrastructure(format!("cursor {} out of range", cursor.0)))
}

/// Change feed over one lease of one container, for one named processor.
#[derive(Debug)]
pub struct PgChangeFeed {
    pool: PgPool,
    container: String,
    processor: String,
    lease: i32,
    lease_count: i32,
    name: String,
    cursor: FeedCursor,
}

impl PgChangeFeed {
    /// Opens lease `lease` of `lease_count` for `processor`, resuming from
    /// its stored cursor or from the beginning.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `lease` is not below a positive
    /// `lease_count`, or `DomainError::Infrastructure` on database failure.
    #[instrument(skip(pool))]
    pub async fn open(
        pool: PgPool,
        container: &str,
        processor: &str,
        lease: u32,
        lease_count: u32,
    ) -> Result<Self, DomainError> {
        if lease_count == 0 || lease >= lease_count {
            return Err(DomainError::Validation(format!(
                "lease {lease} is outside 0..{lease_count}"
            )));
        }
        let lease = i32::try_from(lease)
            .map_err(|_| DomainError::Validation(format!("lease {lease} out of range")))?;
        let lease_count = i32::try_from(lease_count).map_err(|_| {
            DomainError::Validation(format!("lease count {lease_count} out of range"))
        })?;

        sqlx::query(
            r"
            INSERT INTO change_feed_leases (container, processor, lease_count, lease)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(container)
        .bind(processor)
        .bind(lease_count)
        .bind(lease)
        .execute(&pool)
        .await
        .map_err(infrastructure)?;

        let cursor: i64 = sqlx::query_scalar(
            r"
            SELECT acknowledged_position FROM change_feed_leases
            WHERE container = $1 AND processor = $2 AND lease_count = $3 AND lease = $4
            ",
        )
        .bind(container)
        .bind(processor)
        .bind(lease_count)
        .bind(lease)
        .fetch_one(&pool)
        .await
        .map_err(infrastructure)?;

        let cursor = FeedCursor(u64::try_from(cursor).unwrap_or(0));
        info!(cursor = cursor.0, "lease opened");
        Ok(Self {
            pool,
            container: container.to_owned(),
            processor: processor.to_owned(),
            lease,
            lease_count,
            name: format!("{processor}:{container}:{lease}/{lease_count}"),
            cursor,
        })
    }

    /// Opens every lease of `lease_count` for `processor`.
    ///
    /// # Errors
    ///
    /// Returns the first error of [`Self::open`].
    pub async fn open_all(
        pool: &PgPool,
        container: &str,
        processor: &str,
        lease_count: u32,
    ) -> Result<Vec<Self>, DomainError> {
        let mut feeds = Vec::new();
        for lease in 0..lease_count {
            feeds.push(Self::open(pool.clone(), container, processor, lease, lease_count).await?);
        }
        Ok(feeds)
    }

    /// The last acknowledged cursor.
    #[must_use]
    pub fn cursor(&self) -> FeedCursor {
        self.cursor
    }

    async fn stamp(&self) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("eventide-feed:{}", self.container))
            .execute(&mut *tx)
            .await?;
        let stamped = sqlx::query(
            r"
            UPDATE documents AS d
            SET feed_position = s.position
            FROM (
                SELECT partition_key, id, nextval('eventide_feed_position') AS position
                FROM (
                    SELECT partition_key, id
                    FROM documents
                    WHERE container = $1 AND feed_position IS NULL
                    ORDER BY written_at, partition_key, id
                    LIMIT $2
                ) AS pending
            ) AS s
            WHERE d.container = $1 AND d.partition_key = s.partition_key AND d.id = s.id
            ",
        )
        .bind(&self.container)
        .bind(STAMP_LIMIT)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(stamped)
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    fn lease(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(lease = %self.name, cursor = self.cursor.0))]
    async fn next_batch(&mut self, max_batch_size: usize) -> Result<ChangeBatch, DomainError> {
        let stamped = self.stamp().await.map_err(infrastructure)?;
        if stamped > 0 {
            debug!(stamped, "feed positions assigned");
        }

        let rows = sqlx::query(
            r"
            SELECT partition_key, id, body, expires_at, feed_position
            FROM documents
            WHERE container = $1
              AND feed_position > $2
              AND (hashtext(partition_key)::BIGINT + 2147483648) % $3 = $4
            ORDER BY feed_position
            LIMIT $5
            ",
        )
        .bind(&self.container)
        .bind(to_i64(self.cursor)?)
        .bind(i64::from(self.lease_count))
        .bind(i64::from(self.lease))
        .bind(i64::try_from(max_batch_size).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(infrastructure)?;

        let mut cursor = self.cursor;
        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let body: Json<Value> = row.try_get("body").map_err(infrastructure)?;
            let expires_at: Option<DateTime<Utc>> =
                row.try_get("expires_at").map_err(infrastructure)?;
            let position: i64 = row.try_get("feed_position").map_err(infrastructure)?;
            cursor = FeedCursor(u64::try_from(position).unwrap_or(cursor.0));
            documents.push(Document {
                partition_key: row.try_get("partition_key").map_err(infrastructure)?,
                id: row.try_get("id").map_err(infrastructure)?,
                body: body.0,
                expires_at,
            });
        }
        Ok(ChangeBatch {
            lease: self.name.clone(),
            cursor,
            documents,
        })
    }

    #[instrument(skip(self, batch), fields(lease = %self.name, cursor = batch.cursor.0))]
    async fn acknowledge(&mut self, batch: &ChangeBatch) -> Result<(), DomainError> {
        if batch.cursor <= self.cursor {
            return Ok(());
        }
        sqlx::query(
            r"
            UPDATE change_feed_leases
            SET acknowledged_position = GREATEST(acknowledged_position, $5), updated_at = NOW()
            WHERE container = $1 AND processor = $2 AND lease_count = $3 AND lease = $4
            ",
        )
        .bind(&self.container)
        .bind(&self.processor)
        .bind(self.lease_count)
        .bind(self.lease)
        .bind(to_i64(batch.cursor)?)
        .execute(&self.pool)
        .await
        .map_err(infrastructure)?;
        self.cursor = batch.cursor;
        Ok(())
    }
}
