/*!
SQLite checkpoint store.

Durable backend for the `CheckpointStore` trait on a shared `sqlx` pool. One
row per run: the blob is opaque here (schema enforcement lives in the
persistence module), so this file stays focused on database I/O.

When the `sqlite-migrations` feature is enabled (default), embedded migrations
(`sqlx::migrate!("./migrations")`) run on connect; disabling the feature
assumes external migration orchestration.
*/

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::instrument;

use super::{CheckpointStore, Result, StoreError};
use crate::types::RunId;

#[derive(Debug, Error, Diagnostic)]
pub enum SqliteStoreError {
    #[error("SQLx error: {0}")]
    #[diagnostic(
        code(ledgerflow::sqlite::sqlx),
        help("Ensure the SQLite database URL is valid and accessible.")
    )]
    Sqlx(#[from] sqlx::Error),

    #[error("stored run id is not a UUID: {0}")]
    #[diagnostic(code(ledgerflow::sqlite::run_id))]
    RunId(#[from] uuid::Error),
}

impl From<SqliteStoreError> for StoreError {
    fn from(e: SqliteStoreError) -> Self {
        match e {
            SqliteStoreError::Sqlx(err) => StoreError::Backend {
                message: err.to_string(),
            },
            SqliteStoreError::RunId(err) => StoreError::Other {
                message: err.to_string(),
            },
        }
    }
}

/// SQLite-backed durable checkpoint store.
pub struct SqliteCheckpointStore {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore").finish()
    }
}

impl SqliteCheckpointStore {
    /// Connect (or create) a SQLite database at `database_url`.
    /// Example URL: `sqlite://node_checkpoints.db`
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> std::result::Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(SqliteStoreError::from)?;

        #[cfg(feature = "sqlite-migrations")]
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend {
                message: e.to_string(),
            })?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(&self, run_id: RunId, blob: Vec<u8>) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO checkpoints (run_id, blob, updated_at)
            VALUES (?1, ?2, datetime('now'))
            ON CONFLICT(run_id) DO UPDATE
                SET blob = excluded.blob, updated_at = excluded.updated_at
            ",
        )
        .bind(run_id.to_string())
        .bind(blob)
        .execute(self.pool.as_ref())
        .await
        .map_err(SqliteStoreError::from)?;
        Ok(())
    }

    async fn remove(&self, run_id: RunId) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE run_id = ?1")
            .bind(run_id.to_string())
            .execute(self.pool.as_ref())
            .await
            .map_err(SqliteStoreError::from)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(RunId, Vec<u8>)>> {
        let rows = sqlx::query("SELECT run_id, blob FROM checkpoints ORDER BY run_id")
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(SqliteStoreError::from)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("run_id");
            let blob: Vec<u8> = row.get("blob");
            let run_id: RunId = id.parse().map_err(SqliteStoreError::from)?;
            out.push((run_id, blob));
        }
        Ok(out)
    }

    async fn contains(&self, run_id: RunId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM checkpoints WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(SqliteStoreError::from)?;
        Ok(row.is_some())
    }
}
