//! Keyed, time-bounded advisory leases.
//!
//! A lease is held by a [`HolderToken`] until it is released or its expiry
//! passes. Expiry is checked when a lease is read, never by a sweeper, so a
//! crashed holder's lease simply becomes acquirable once it runs out.
//! Holders re-acquire before every side effect; [`LeaseGuard`] packages that
//! pattern and releases on every exit path.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;
#[cfg(feature = "database")]
pub mod redis_store;

use std::{
    fmt,
    process,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::{DroverError, Result};

pub use memory::InMemoryLeaseStore;
#[cfg(feature = "database")]
pub use postgres::{ObjectLockStore, WorkerRowLeaseStore};
#[cfg(feature = "database")]
pub use redis_store::RedisLeaseStore;

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identity written into every lease a process takes.
///
/// Tokens look like `monitor-host1_4242-1f`: agent name, host, pid and a
/// process-wide sequence, so two agents in one process never share a token.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderToken(Arc<str>);

impl HolderToken {
    pub fn for_agent(agent: &str) -> Self {
        let seq = HOLDER_SEQ.fetch_add(1, Ordering::Relaxed);
        let host = hostname();
        Self(Arc::from(format!(
            "{agent}-{host}_{}-{seq:x}",
            process::id()
        )))
    }

    /// Wrap an existing token, e.g. one read back from the store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(Arc::from(raw.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for HolderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HolderToken").field(&self.as_str()).finish()
    }
}

impl fmt::Display for HolderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Lease key for a row of an entity table, e.g. `worker:42`.
pub fn entity_key(kind: &str, id: i64) -> String {
    format!("{kind}:{id}")
}

/// Inverse of [`entity_key`]: the numeric id after the last `:`.
pub fn entity_id_from_key(key: &str) -> Result<i64> {
    key.rsplit(':')
        .next()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| {
            DroverError::Config(format!("lease key '{key}' does not name an entity row"))
        })
}

/// Snapshot of a live lease.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    pub holder: HolderToken,
    pub expires_at: DateTime<Utc>,
}

/// Store contract for leases. Every call is a single conditional write (or
/// read) against the store; contention is reported as `Ok(false)`, never as
/// an error, and nothing retries internally.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take `key` for `ttl` if it is free, expired, or already held by
    /// `holder` (renewal).
    async fn try_acquire(
        &self,
        key: &str,
        holder: &HolderToken,
        ttl: Duration,
    ) -> Result<bool>;

    /// Drop the lease if `holder` currently holds it.
    async fn release(&self, key: &str, holder: &HolderToken) -> Result<bool>;

    /// Current unexpired lease on `key`, if any.
    async fn inspect(&self, key: &str) -> Result<Option<Lease>>;

    /// Operator override: clear `key` whoever holds it.
    async fn force_release(&self, key: &str) -> Result<bool>;
}

/// Scoped lease. Acquire once, [`revalidate`](LeaseGuard::revalidate) right
/// before each side effect, and [`release`](LeaseGuard::release) when done.
/// A guard dropped without an explicit release spawns a best-effort release
/// on the current runtime; outside a runtime the lease is left to expire.
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    key: String,
    holder: HolderToken,
    ttl: Duration,
    released: bool,
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("ttl", &self.ttl)
            .field("released", &self.released)
            .finish()
    }
}

impl LeaseGuard {
    /// `Ok(None)` means another holder is active.
    pub async fn acquire(
        store: Arc<dyn LeaseStore>,
        key: impl Into<String>,
        holder: HolderToken,
        ttl: Duration,
    ) -> Result<Option<Self>> {
        let key = key.into();
        if !store.try_acquire(&key, &holder, ttl).await? {
            debug!(target: "drover::lease", %key, %holder, "lease held elsewhere; skipping");
            return Ok(None);
        }
        debug!(target: "drover::lease", %key, %holder, ttl_ms = ttl.as_millis() as u64, "lease acquired");
        Ok(Some(Self {
            store,
            key,
            holder,
            ttl,
            released: false,
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &HolderToken {
        &self.holder
    }

    /// Renew the lease. `false` means it expired and someone else took it; the
    /// caller must not perform the pending side effect.
    pub async fn revalidate(&self) -> Result<bool> {
        let renewed = self
            .store
            .try_acquire(&self.key, &self.holder, self.ttl)
            .await?;
        if !renewed {
            warn!(target: "drover::lease", key = %self.key, holder = %self.holder, "lease lost before side effect");
        }
        Ok(renewed)
    }

    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        let released = self.store.release(&self.key, &self.holder).await?;
        debug!(target: "drover::lease", key = %self.key, holder = %self.holder, released, "lease released");
        Ok(released)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let key = std::mem::take(&mut self.key);
        let holder = self.holder.clone();
        match Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    if let Err(err) = store.release(&key, &holder).await {
                        warn!(target: "drover::lease", %key, %holder, error = %err, "release on drop failed; lease will expire");
                    }
                });
            }
            Err(_) => {
                warn!(target: "drover::lease", %key, %holder, "lease dropped outside a runtime; it will expire");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_tokens_are_unique_per_call() {
        let a = HolderToken::for_agent("monitor");
        let b = HolderToken::for_agent("monitor");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("monitor-"));
        assert!(a.as_str().contains(&format!("_{}-", process::id())));
    }

    #[test]
    fn entity_keys_round_trip_ids() {
        let key = entity_key("worker", 42);
        assert_eq!(key, "worker:42");
        assert_eq!(entity_id_from_key(&key).unwrap(), 42);
        assert_eq!(entity_id_from_key("17").unwrap(), 17);
        assert!(entity_id_from_key("worker:abc").is_err());
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
        let holder = HolderToken::for_agent("test");
        let guard = LeaseGuard::acquire(
            Arc::clone(&store),
            "worker:1",
            holder,
            Duration::from_secs(60),
        )
        .await
        .unwrap()
        .expect("free key");
        drop(guard);

        for _ in 0..10 {
            if store.inspect("worker:1").await.unwrap().is_none() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("lease still held after drop");
    }
}
