//! Tracked entities and the store contracts agents consume.
//!
//! Entities (workers, jobs) belong to the relational store. The monitor
//! scheduler only reads and groups them through [`EntitySource`]; agents read
//! candidates and persist outcomes through [`EntityStore`].

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::InMemoryEntityStore;
#[cfg(feature = "database")]
pub use postgres::PostgresWorkerStore;

/// Status written by [`EntityStore::mark_failed`].
pub const FAILED_STATUS: &str = "failed";

/// Statuses the monitor no longer polls.
pub const TERMINAL_STATUSES: &[&str] = &["finished", "failed", "cancelled"];

/// Reference to one row of the entity table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub id: i64,
    /// Grouping key, e.g. the queue or site name.
    pub partition: String,
    pub modified_at: Option<DateTime<Utc>>,
    pub status: String,
}

impl TrackedEntity {
    pub fn new(id: i64, partition: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id,
            partition: partition.into(),
            modified_at: None,
            status: status.into(),
        }
    }

    pub fn modified(mut self, at: DateTime<Utc>) -> Self {
        self.modified_at = Some(at);
        self
    }

    pub fn is_terminal(&self) -> bool {
        TERMINAL_STATUSES.contains(&self.status.as_str())
    }
}

/// Read side used by the monitor scheduler.
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Non-terminal entities last modified before `threshold` (or never),
    /// ordered by partition, then modification time, then id. At most
    /// `limit` rows.
    async fn list_stale(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TrackedEntity>>;
}

/// Read/write side used by agent loops.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Entities flagged as needing action, ordered by partition then id.
    async fn fetch_candidates(&self, limit: usize) -> Result<Vec<TrackedEntity>>;

    /// Persist a successful action: optionally move to `status`, record
    /// `detail`, clear the action-needed flag and bump `modified_at`.
    async fn mark_done(&self, id: i64, status: Option<&str>, detail: &str) -> Result<()>;

    /// Move the entity to its terminal failed state.
    async fn mark_failed(&self, id: i64, detail: &str) -> Result<()>;
}
