//! `PostgreSQL` implementation of the `DocumentStore` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use eventide_core::document::{
    ContinuationToken, Document, DocumentError, DocumentQuery, DocumentStore, FieldFilter,
    FilterOp, Page, SortDirection, VersionToken, Versioned,
};

/// Predicate that hides expired documents.
const LIVE: &str = "(expires_at IS NULL OR expires_at > now())";

/// Replaces an expired occupant on create; a live one makes the insert a
/// no-op.
const REPLACE_IF_EXPIRED: &str = " ON CONFLICT (container, partition_key, id) DO UPDATE SET \
     body = EXCLUDED.body, etag = EXCLUDED.etag, expires_at = EXCLUDED.expires_at, \
     written_at = clock_timestamp(), feed_position = NULL \
     WHERE documents.expires_at IS NOT NULL AND documents.expires_at <= now()";

/// PostgreSQL-backed document store for one container.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    container: String,
}

impl PgDocumentStore {
    /// Creates a store addressing `container` in the shared documents table.
    #[must_use]
    pub fn new(pool: PgPool, container: impl Into<String>) -> Self {
        Self {
            pool,
            container: container.into(),
        }
    }
}

fn backend(err: sqlx::Error) -> DocumentError {
    DocumentError::Backend(err.to_string())
}

fn token(etag: Uuid) -> VersionToken {
    VersionToken::new(etag.to_string())
}

fn decode_row(row: &PgRow) -> Result<Versioned<Document>, sqlx::Error> {
    let body: Json<Value> = row.try_get("body")?;
    let etag: Uuid = row.try_get("etag")?;
    let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at")?;
    Ok(Versioned {
        value: Document {
            partition_key: row.try_get("partition_key")?,
            id: row.try_get("id")?,
            body: body.0,
            expires_at,
        },
        token: token(etag),
    })
}

fn path(field: &str) -> Vec<String> {
    field.split('.').map(str::to_owned).collect()
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &FieldFilter) {
    let operator = match filter.op {
        FilterOp::IsNull => {
            qb.push(" AND COALESCE(jsonb_typeof(body #> ")
                .push_bind(path(&filter.field))
                .push("), 'null') = 'null'");
            return;
        }
        FilterOp::IsNotNull => {
            qb.push(" AND COALESCE(jsonb_typeof(body #> ")
                .push_bind(path(&filter.field))
                .push("), 'null') <> 'null'");
            return;
        }
        FilterOp::Eq => " = ",
        FilterOp::Ne => " <> ",
        FilterOp::Gt => " > ",
        FilterOp::Gte => " >= ",
        FilterOp::Lt => " < ",
        FilterOp::Lte => " <= ",
    };
    // An absent path yields SQL NULL, so comparisons against it are false.
    qb.push(" AND body #> ")
        .push_bind(path(&filter.field))
        .push(operator)
        .push_bind(Json(filter.value.clone()));
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    #[instrument(skip(self, document), fields(container = %self.container, partition_key = %document.partition_key, id = %document.id))]
    async fn create_if_absent(&self, document: Document) -> Result<VersionToken, DocumentError> {
        let partition_key = document.partition_key.clone();
        self.create_all_if_absent(&partition_key, vec![document])
            .await?
            .pop()
            .ok_or_else(|| DocumentError::Backend("create produced no token".into()))
    }

    #[instrument(skip(self, documents), fields(container = %self.container, count = documents.len()))]
    async fn create_all_if_absent(
        &self,
        partition_key: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<VersionToken>, DocumentError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(stray) = documents.iter().find(|d| d.partition_key != partition_key) {
            return Err(DocumentError::Backend(format!(
                "document {} targets partition {} inside a batch for {partition_key}",
                stray.id, stray.partition_key
            )));
        }
        let etags: Vec<Uuid> = documents.iter().map(|_| Uuid::new_v4()).collect();

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO documents (container, partition_key, id, body, etag, expires_at) ",
        );
        qb.push_values(documents.iter().zip(&etags), |mut row, (document, etag)| {
            row.push_bind(self.container.clone())
                .push_bind(document.partition_key.clone())
                .push_bind(document.id.clone())
                .push_bind(Json(document.body.clone()))
                .push_bind(*etag)
                .push_bind(document.expires_at);
        });
        qb.push(REPLACE_IF_EXPIRED).push(" RETURNING id");
        let written: Vec<String> = qb
            .build_query_scalar()
            .fetch_all(&mut *tx)
            .await
            .map_err(backend)?;

        if let Some(taken) = documents.iter().find(|d| !written.contains(&d.id)) {
            // Dropping the transaction rolls back the rows that did go in.
            debug!(id = %taken.id, "slot already taken; batch rejected");
            return Err(DocumentError::AlreadyExists {
                partition_key: partition_key.to_owned(),
                id: taken.id.clone(),
            });
        }
        tx.commit().await.map_err(backend)?;
        Ok(etags.into_iter().map(token).collect())
    }

    #[instrument(skip(self, document, if_match), fields(container = %self.container, partition_key = %document.partition_key, id = %document.id))]
    async fn upsert(
        &self,
        document: Document,
        if_match: Option<&VersionToken>,
    ) -> Result<VersionToken, DocumentError> {
        let etag = Uuid::new_v4();
        let Some(expected) = if_match else {
            sqlx::query(
                r"
                INSERT INTO documents (container, partition_key, id, body, etag, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (container, partition_key, id) DO UPDATE SET
                    body = EXCLUDED.body,
                    etag = EXCLUDED.etag,
                    expires_at = EXCLUDED.expires_at,
                    written_at = clock_timestamp(),
                    feed_position = NULL
                ",
            )
            .bind(&self.container)
            .bind(&document.partition_key)
            .bind(&document.id)
            .bind(Json(&document.body))
            .bind(etag)
            .bind(document.expires_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
            return Ok(token(etag));
        };

        let mismatch = || DocumentError::TokenMismatch {
            partition_key: document.partition_key.clone(),
            id: document.id.clone(),
        };
        let expected = Uuid::parse_str(expected.as_str()).map_err(|_| mismatch())?;
        let result = sqlx::query(&format!(
            r"
            UPDATE documents SET
                body = $4,
                etag = $5,
                expires_at = $6,
                written_at = clock_timestamp(),
                feed_position = NULL
            WHERE container = $1 AND partition_key = $2 AND id = $3 AND etag = $7 AND {LIVE}
            "
        ))
        .bind(&self.container)
        .bind(&document.partition_key)
        .bind(&document.id)
        .bind(Json(&document.body))
        .bind(etag)
        .bind(document.expires_at)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(mismatch());
        }
        Ok(token(etag))
    }

    #[instrument(skip(self), fields(container = %self.container))]
    async fn read(
        &self,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<Versioned<Document>>, DocumentError> {
        let row = sqlx::query(&format!(
            "SELECT partition_key, id, body, etag, expires_at FROM documents \
             WHERE container = $1 AND partition_key = $2 AND id = $3 AND {LIVE}"
        ))
        .bind(&self.container)
        .bind(partition_key)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(decode_row).transpose().map_err(backend)
    }

    #[instrument(skip(self, if_match), fields(container = %self.container))]
    async fn delete(
        &self,
        partition_key: &str,
        id: &str,
        if_match: Option<&VersionToken>,
    ) -> Result<(), DocumentError> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM documents WHERE container = ");
        qb.push_bind(&self.container)
            .push(" AND partition_key = ")
            .push_bind(partition_key)
            .push(" AND id = ")
            .push_bind(id);

        let mismatch = || DocumentError::TokenMismatch {
            partition_key: partition_key.to_owned(),
            id: id.to_owned(),
        };
        if let Some(expected) = if_match {
            let expected = Uuid::parse_str(expected.as_str()).map_err(|_| mismatch())?;
            qb.push(" AND etag = ")
                .push_bind(expected)
                .push(" AND ")
                .push(LIVE);
        }
        let result = qb.build().execute(&self.pool).await.map_err(backend)?;
        if if_match.is_some() && result.rows_affected() == 0 {
            return Err(mismatch());
        }
        Ok(())
    }

    #[instrument(skip(self, query, continuation), fields(container = %self.container, partition_key = ?query.partition_key))]
    async fn query(
        &self,
        query: &DocumentQuery,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Page, DocumentError> {
        let offset: i64 = match continuation {
            Some(token) => token.0.parse().map_err(|e| {
                DocumentError::Backend(format!("malformed continuation {:?}: {e}", token.0))
            })?,
            None => 0,
        };
        let page_size = query.page_size.max(1);

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT partition_key, id, body, etag, expires_at FROM documents WHERE container = ",
        );
        qb.push_bind(&self.container).push(" AND ").push(LIVE);
        if let Some(partition_key) = &query.partition_key {
            qb.push(" AND partition_key = ").push_bind(partition_key);
        }
        for filter in &query.filters {
            push_filter(&mut qb, filter);
        }
        qb.push(" ORDER BY ");
        if let Some(order) = &query.order_by {
            qb.push("body #> ").push_bind(path(&order.field));
            qb.push(match order.direction {
                SortDirection::Ascending => " ASC NULLS LAST, ",
                SortDirection::Descending => " DESC NULLS FIRST, ",
            });
        }
        // One extra row tells whether another page follows.
        qb.push("partition_key, id LIMIT ")
            .push_bind(i64::try_from(page_size + 1).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(backend)?;
        let has_more = rows.len() > page_size;
        let documents = rows
            .iter()
            .take(page_size)
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        let next = offset + i64::try_from(documents.len()).unwrap_or(i64::MAX);
        Ok(Page {
            documents,
            continuation: has_more.then(|| ContinuationToken(next.to_string())),
        })
    }
}
