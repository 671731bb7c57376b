//! Document store database schema.

use sqlx::PgPool;

/// SQL to create the documents table, the feed position sequence and the
/// change feed lease table. Mirrors `migrations/0001_documents.sql`.
pub const CREATE_DOCUMENTS_SCHEMA: &str = r"
CREATE SEQUENCE IF NOT EXISTS eventide_feed_position;

CREATE TABLE IF NOT EXISTS documents (
    container      TEXT        NOT NULL,
    partition_key  TEXT        NOT NULL,
    id             TEXT        NOT NULL,
    body           JSONB       NOT NULL,
    etag           UUID        NOT NULL,
    expires_at     TIMESTAMPTZ NULL,
    written_at     TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
    feed_position  BIGINT      NULL,
    PRIMARY KEY (container, partition_key, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_unstamped
    ON documents (container, written_at)
    WHERE feed_position IS NULL;

CREATE INDEX IF NOT EXISTS idx_documents_feed
    ON documents (container, feed_position)
    WHERE feed_position IS NOT NULL;

CREATE TABLE IF NOT EXISTS change_feed_leases (
    container   TEXT        NOT NULL,
    processor   TEXT        NOT NULL,
    lease_count INTEGER     NOT NULL,
    lease       INTEGER     NOT NULL,
    acknowledged_position BIGINT NOT NULL DEFAULT 0,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (container, processor, lease_count, lease)
);
";

/// Creates the schema if it does not exist yet.
///
/// # Errors
///
/// Returns the driver error if any statement fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(CREATE_DOCUMENTS_SCHEMA).execute(pool).await?;
    Ok(())
}
