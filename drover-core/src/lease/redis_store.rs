//! Redis lease store: `SET NX PX` for a fresh claim, Lua scripts for the
//! holder-checked renew and release so neither can touch another holder's key.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, aio::ConnectionManager};

use crate::error::{DroverError, Result};

use super::{HolderToken, Lease, LeaseStore};

const KEY_PREFIX: &str = "drover:lease:";

mod scripts {
    use redis::Script;

    /// Extend the key's expiry if it still belongs to the caller.
    pub fn renew() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                redis.call('PEXPIRE', KEYS[1], ARGV[2])
                return 1
            end
            return 0
            "#,
        )
    }

    /// Delete the key if it still belongs to the caller.
    pub fn release() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        )
    }
}

#[derive(Clone)]
pub struct RedisLeaseStore {
    redis: ConnectionManager,
}

impl fmt::Debug for RedisLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLeaseStore")
            .field("key_prefix", &KEY_PREFIX)
            .finish()
    }
}

fn redis_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl RedisLeaseStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| DroverError::Config(format!("invalid Redis URL: {e}")))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| DroverError::Backend(format!("Redis connection failed: {e}")))?;
        Ok(Self { redis })
    }

    pub fn from_manager(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &HolderToken,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.redis.clone();
        let redis_key = redis_key(key);
        let ttl_ms = ttl_millis(ttl);

        let fresh: Option<String> = redis::cmd("SET")
            .arg(&redis_key)
            .arg(holder.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| DroverError::Backend(format!("Redis lease acquire failed: {e}")))?;
        if fresh.is_some() {
            return Ok(true);
        }

        let renewed: i64 = scripts::renew()
            .key(&redis_key)
            .arg(holder.as_str())
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DroverError::Backend(format!("Redis lease renew failed: {e}")))?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &str, holder: &HolderToken) -> Result<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = scripts::release()
            .key(redis_key(key))
            .arg(holder.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DroverError::Backend(format!("Redis lease release failed: {e}")))?;
        Ok(removed == 1)
    }

    async fn inspect(&self, key: &str) -> Result<Option<Lease>> {
        let mut conn = self.redis.clone();
        let redis_key = redis_key(key);
        let holder: Option<String> = conn
            .get(&redis_key)
            .await
            .map_err(|e| DroverError::Backend(format!("Redis lease lookup failed: {e}")))?;
        let Some(holder) = holder else {
            return Ok(None);
        };
        let remaining_ms: i64 = conn
            .pttl(&redis_key)
            .await
            .map_err(|e| DroverError::Backend(format!("Redis lease ttl failed: {e}")))?;
        if remaining_ms < 0 {
            // -2: vanished between the two reads, -1: no expiry set.
            return Ok(None);
        }
        Ok(Some(Lease {
            key: key.to_string(),
            holder: HolderToken::from_raw(holder),
            expires_at: Utc::now() + chrono::Duration::milliseconds(remaining_ms),
        }))
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn
            .del(redis_key(key))
            .await
            .map_err(|e| DroverError::Backend(format!("Redis lease delete failed: {e}")))?;
        Ok(removed > 0)
    }
}
