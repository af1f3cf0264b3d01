use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgPool, Postgres};

use crate::config::DatabaseCfg;
use crate::store::{ImageRecord, RecordDeleter, RecordStore, StoreError};

pub struct PgStore {
    pool: PgPool,
    cfg: DatabaseCfg,
}

impl PgStore {
    pub async fn connect(cfg: &DatabaseCfg) -> Result<Self> {
        let url = std::env::var(&cfg.url_env)
            .with_context(|| format!("{} not set", cfg.url_env))?;
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(&url)
            .await
            .context("failed to connect to postgres")?;

        tracing::info!(table = %cfg.table, "database connected");
        Ok(Self { pool, cfg: cfg.clone() })
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn fetch_records(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let c = &self.cfg;
        let sql = format!(
            "SELECT {id}::BIGINT AS id, {url} AS url FROM {table} \
             WHERE {id} IS NOT NULL AND {url} IS NOT NULL AND {url} <> '' ORDER BY {id}",
            id = c.id_column,
            url = c.url_column,
            table = c.table,
        );
        let rows = sqlx::query_as::<_, ImageRecord>(&sql).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn ids_with_metadata(&self, ids: &[i64]) -> Result<BTreeSet<i64>, StoreError> {
        let c = &self.cfg;
        let (Some(table), Some(fk)) = (&c.metadata_table, &c.metadata_fk_column) else {
            return Ok(BTreeSet::new());
        };
        if ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let sql = format!("SELECT DISTINCT {fk}::BIGINT FROM {table} WHERE {fk} = ANY($1)");
        let found = sqlx::query_scalar::<_, i64>(&sql).bind(ids).fetch_all(&self.pool).await?;
        Ok(found.into_iter().collect())
    }

    async fn open_deleter(&self) -> Result<Box<dyn RecordDeleter>, StoreError> {
        let conn = self.pool.acquire().await?;
        let sql = format!("DELETE FROM {} WHERE {} = $1", self.cfg.table, self.cfg.id_column);
        Ok(Box::new(PgDeleter { conn, sql }))
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("database connection closed");
    }
}

/// Deletes over one pooled connection, one transaction per id.
struct PgDeleter {
    conn: PoolConnection<Postgres>,
    sql: String,
}

#[async_trait]
impl RecordDeleter for PgDeleter {
    async fn delete(&mut self, id: i64) -> Result<u64, StoreError> {
        let mut tx = self.conn.begin().await?;
        match sqlx::query(&self.sql).bind(id).execute(&mut *tx).await {
            Ok(res) => {
                tx.commit().await?;
                Ok(res.rows_affected())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(id, error = %rb, "rollback failed");
                }
                Err(e.into())
            }
        }
    }
}
