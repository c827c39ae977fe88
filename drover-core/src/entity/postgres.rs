use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::error::{DroverError, Result};

use super::{EntitySource, EntityStore, FAILED_STATUS, TERMINAL_STATUSES, TrackedEntity};

#[derive(Debug, FromRow)]
struct WorkerRow {
    id: i64,
    partition_key: String,
    modified_at: Option<DateTime<Utc>>,
    status: String,
}

impl From<WorkerRow> for TrackedEntity {
    fn from(row: WorkerRow) -> Self {
        Self {
            id: row.id,
            partition: row.partition_key,
            modified_at: row.modified_at,
            status: row.status,
        }
    }
}

/// `workers` table access for the monitor and agent loops.
#[derive(Clone)]
pub struct PostgresWorkerStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresWorkerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresWorkerStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

fn terminal_statuses() -> Vec<String> {
    TERMINAL_STATUSES.iter().map(|s| s.to_string()).collect()
}

impl PostgresWorkerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitySource for PostgresWorkerStore {
    async fn list_stale(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TrackedEntity>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(
            r#"
            SELECT id, partition_key, modified_at, status
            FROM workers
            WHERE status <> ALL($1)
              AND (modified_at IS NULL OR modified_at < $2)
            ORDER BY partition_key, modified_at ASC NULLS FIRST, id
            LIMIT $3
            "#,
        )
        .bind(terminal_statuses())
        .bind(threshold)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("stale worker query failed: {e}")))?;
        Ok(rows.into_iter().map(TrackedEntity::from).collect())
    }
}

#[async_trait]
impl EntityStore for PostgresWorkerStore {
    async fn fetch_candidates(&self, limit: usize) -> Result<Vec<TrackedEntity>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(
            r#"
            SELECT id, partition_key, modified_at, status
            FROM workers
            WHERE needs_action
            ORDER BY partition_key, id
            LIMIT $1
            "#,
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("candidate worker query failed: {e}")))?;
        Ok(rows.into_iter().map(TrackedEntity::from).collect())
    }

    async fn mark_done(&self, id: i64, status: Option<&str>, detail: &str) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE workers
            SET status = COALESCE($2, status),
                last_detail = $3,
                needs_action = FALSE,
                modified_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("worker update failed: {e}")))?;
        if res.rows_affected() == 0 {
            return Err(DroverError::NotFound(format!("worker {id}")));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, detail: &str) -> Result<()> {
        self.mark_done(id, Some(FAILED_STATUS), detail).await
    }
}
