use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{sync::Mutex, time::Instant};

use crate::error::Result;

use super::{HolderToken, Lease, LeaseStore};

#[derive(Clone, Debug)]
struct Held {
    holder: HolderToken,
    expires_at: Instant,
}

/// Process-local lease table. Expiry uses tokio's clock so paused-time tests
/// can advance past a lease.
#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    leases: Arc<Mutex<HashMap<String, Held>>>,
}

impl fmt::Debug for InMemoryLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryLeaseStore");
        match self.leases.try_lock() {
            Ok(leases) => debug.field("leases", &leases.len()),
            Err(_) => debug.field("leases", &"<locked>"),
        };
        debug.finish()
    }
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &HolderToken,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        if let Some(held) = leases.get(key)
            && held.holder != *holder
            && held.expires_at > now
        {
            return Ok(false);
        }
        leases.insert(
            key.to_string(),
            Held {
                holder: holder.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, holder: &HolderToken) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some(held) if held.holder == *holder => {
                let live = held.expires_at > Instant::now();
                leases.remove(key);
                Ok(live)
            }
            _ => Ok(false),
        }
    }

    async fn inspect(&self, key: &str) -> Result<Option<Lease>> {
        let now = Instant::now();
        let leases = self.leases.lock().await;
        Ok(leases
            .get(key)
            .filter(|held| held.expires_at > now)
            .map(|held| {
                let remaining = held.expires_at.saturating_duration_since(now);
                Lease {
                    key: key.to_string(),
                    holder: held.holder.clone(),
                    expires_at: Utc::now()
                        + chrono::Duration::from_std(remaining)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                }
            }))
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        Ok(self.leases.lock().await.remove(key).is_some())
    }
}
