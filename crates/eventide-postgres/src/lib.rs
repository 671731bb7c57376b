//! PostgreSQL implementations of the Eventide document store and change feed.
//!
//! Every container (`events`, `snapshots`, ...) lives in one `documents`
//! table, keyed by `(container, partition_key, id)`.

pub mod pg_change_feed;
pub mod pg_document_store;
pub mod schema;

pub use pg_change_feed::PgChangeFeed;
pub use pg_document_store::PgDocumentStore;
