//! Postgres lease stores.
//!
//! [`ObjectLockStore`] keys leases by arbitrary strings in `object_locks`.
//! [`WorkerRowLeaseStore`] writes the lease onto the guarded `workers` row
//! itself (`locked_by`, `lock_time`), so the claim and the row live together.
//! Both rely on single-statement conditional writes for atomicity.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    agent::ENTITY_LEASE_KIND,
    error::{DroverError, Result},
};

use super::{HolderToken, Lease, LeaseStore, entity_id_from_key};

#[derive(Clone)]
pub struct ObjectLockStore {
    pool: PgPool,
}

impl fmt::Debug for ObjectLockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectLockStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl ObjectLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for ObjectLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &HolderToken,
        ttl: Duration,
    ) -> Result<bool> {
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO object_locks (lock_key, holder, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (lock_key) DO UPDATE
            SET holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE object_locks.holder = EXCLUDED.holder
               OR object_locks.expires_at < NOW()
            RETURNING lock_key
            "#,
        )
        .bind(key)
        .bind(holder.as_str())
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("object lock acquire failed: {e}")))?;
        Ok(acquired.is_some())
    }

    async fn release(&self, key: &str, holder: &HolderToken) -> Result<bool> {
        let live: Option<bool> = sqlx::query_scalar(
            r#"
            DELETE FROM object_locks
            WHERE lock_key = $1 AND holder = $2
            RETURNING expires_at >= NOW()
            "#,
        )
        .bind(key)
        .bind(holder.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("object lock release failed: {e}")))?;
        Ok(live.unwrap_or(false))
    }

    async fn inspect(&self, key: &str) -> Result<Option<Lease>> {
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT holder, expires_at
            FROM object_locks
            WHERE lock_key = $1 AND expires_at >= NOW()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("object lock lookup failed: {e}")))?;
        Ok(row.map(|(holder, expires_at)| Lease {
            key: key.to_string(),
            holder: HolderToken::from_raw(holder),
            expires_at,
        }))
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM object_locks WHERE lock_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                DroverError::Backend(format!("object lock force release failed: {e}"))
            })?;
        Ok(res.rows_affected() > 0)
    }
}

/// Lease carried on `workers` rows. `lock_time` records when the lease was
/// taken; it counts as expired once older than the caller's interval, so all
/// agents contending for workers must use the same lock interval.
#[derive(Clone)]
pub struct WorkerRowLeaseStore {
    pool: PgPool,
    lock_interval: Duration,
}

impl fmt::Debug for WorkerRowLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRowLeaseStore")
            .field("pool_size", &self.pool.size())
            .field("lock_interval", &self.lock_interval)
            .finish()
    }
}

impl WorkerRowLeaseStore {
    /// `lock_interval` is used by [`LeaseStore::inspect`] to decide whether a
    /// stored claim is still live.
    pub fn new(pool: PgPool, lock_interval: Duration) -> Self {
        Self {
            pool,
            lock_interval,
        }
    }
}

/// Only entity keys map onto a `workers` row; other kinds need an
/// [`ObjectLockStore`].
fn worker_row_id(key: &str) -> Result<i64> {
    match key.split_once(':') {
        Some((kind, _)) if kind == ENTITY_LEASE_KIND => entity_id_from_key(key),
        _ => Err(DroverError::Config(format!(
            "lease key '{key}' does not name a worker row"
        ))),
    }
}

#[async_trait]
impl LeaseStore for WorkerRowLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &HolderToken,
        ttl: Duration,
    ) -> Result<bool> {
        let worker_id = worker_row_id(key)?;
        let res = sqlx::query(
            r#"
            UPDATE workers
            SET locked_by = $2, lock_time = NOW()
            WHERE id = $1
              AND (locked_by IS NULL
                   OR locked_by = $2
                   OR lock_time IS NULL
                   OR lock_time < NOW() - make_interval(secs => $3))
            "#,
        )
        .bind(worker_id)
        .bind(holder.as_str())
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("worker lock acquire failed: {e}")))?;
        Ok(res.rows_affected() > 0)
    }

    async fn release(&self, key: &str, holder: &HolderToken) -> Result<bool> {
        let worker_id = worker_row_id(key)?;
        let live: Option<bool> = sqlx::query_scalar(
            r#"
            UPDATE workers
            SET locked_by = NULL, lock_time = NULL
            WHERE id = $1 AND locked_by = $2
            RETURNING TRUE
            "#,
        )
        .bind(worker_id)
        .bind(holder.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("worker lock release failed: {e}")))?;
        Ok(live.is_some())
    }

    async fn inspect(&self, key: &str) -> Result<Option<Lease>> {
        let worker_id = worker_row_id(key)?;
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT locked_by, lock_time + make_interval(secs => $2)
            FROM workers
            WHERE id = $1
              AND locked_by IS NOT NULL
              AND lock_time IS NOT NULL
              AND lock_time >= NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(worker_id)
        .bind(self.lock_interval.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DroverError::Backend(format!("worker lock lookup failed: {e}")))?;
        Ok(row.map(|(holder, expires_at)| Lease {
            key: key.to_string(),
            holder: HolderToken::from_raw(holder),
            expires_at,
        }))
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        let worker_id = worker_row_id(key)?;
        let res = sqlx::query(
            r#"
            UPDATE workers
            SET locked_by = NULL, lock_time = NULL
            WHERE id = $1 AND locked_by IS NOT NULL
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            DroverError::Backend(format!("worker lock force release failed: {e}"))
        })?;
        Ok(res.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::worker_row_id;

    #[test]
    fn worker_rows_accept_only_entity_keys() {
        assert_eq!(worker_row_id("worker:42").unwrap(), 42);
        assert!(worker_row_id("chunk:monitor:42").is_err());
        assert!(worker_row_id("42").is_err());
    }
}
