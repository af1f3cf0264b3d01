use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ImageRecord {
    pub id: i64,
    pub url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_) => StoreError::Unavailable(e.to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Read side of the image table plus the metadata lookup used for retention.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All `(id, url)` pairs with a non-empty url.
    async fn fetch_records(&self) -> Result<Vec<ImageRecord>, StoreError>;

    /// Subset of `ids` that have an associated metadata row.
    async fn ids_with_metadata(&self, ids: &[i64]) -> Result<BTreeSet<i64>, StoreError>;

    /// Acquire the single connection the deletion phase runs on.
    async fn open_deleter(&self) -> Result<Box<dyn RecordDeleter>, StoreError>;

    async fn close(&self);
}

#[async_trait]
pub trait RecordDeleter: Send {
    /// Delete one record in its own unit of work. Returns affected rows;
    /// zero means the row was already gone.
    async fn delete(&mut self, id: i64) -> Result<u64, StoreError>;
}
