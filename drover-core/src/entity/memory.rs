use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{DroverError, Result};

use super::{EntitySource, EntityStore, FAILED_STATUS, TrackedEntity};

#[derive(Clone, Debug)]
struct Row {
    entity: TrackedEntity,
    needs_action: bool,
    last_detail: Option<String>,
}

/// Process-local entity table keyed by id.
#[derive(Clone, Default)]
pub struct InMemoryEntityStore {
    rows: Arc<Mutex<BTreeMap<i64, Row>>>,
}

impl fmt::Debug for InMemoryEntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryEntityStore");
        match self.rows.try_lock() {
            Ok(rows) => debug.field("rows", &rows.len()),
            Err(_) => debug.field("rows", &"<locked>"),
        };
        debug.finish()
    }
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, entity: TrackedEntity) {
        let mut rows = self.rows.lock().await;
        let needs_action = rows.get(&entity.id).is_some_and(|row| row.needs_action);
        rows.insert(
            entity.id,
            Row {
                entity,
                needs_action,
                last_detail: None,
            },
        );
    }

    /// Flag an entity as needing action by the next agent pass.
    pub async fn flag(&self, id: i64) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| DroverError::NotFound(format!("entity {id}")))?;
        row.needs_action = true;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Option<TrackedEntity> {
        self.rows.lock().await.get(&id).map(|row| row.entity.clone())
    }

    pub async fn needs_action(&self, id: i64) -> bool {
        self.rows
            .lock()
            .await
            .get(&id)
            .is_some_and(|row| row.needs_action)
    }

    pub async fn last_detail(&self, id: i64) -> Option<String> {
        self.rows
            .lock()
            .await
            .get(&id)
            .and_then(|row| row.last_detail.clone())
    }
}

#[async_trait]
impl EntitySource for InMemoryEntityStore {
    async fn list_stale(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TrackedEntity>> {
        let rows = self.rows.lock().await;
        let mut stale: Vec<TrackedEntity> = rows
            .values()
            .map(|row| &row.entity)
            .filter(|entity| !entity.is_terminal())
            .filter(|entity| entity.modified_at.is_none_or(|at| at < threshold))
            .cloned()
            .collect();
        stale.sort_by(|a, b| {
            a.partition
                .cmp(&b.partition)
                .then(a.modified_at.cmp(&b.modified_at))
                .then(a.id.cmp(&b.id))
        });
        stale.truncate(limit);
        Ok(stale)
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn fetch_candidates(&self, limit: usize) -> Result<Vec<TrackedEntity>> {
        let rows = self.rows.lock().await;
        let mut candidates: Vec<TrackedEntity> = rows
            .values()
            .filter(|row| row.needs_action)
            .map(|row| row.entity.clone())
            .collect();
        candidates.sort_by(|a, b| a.partition.cmp(&b.partition).then(a.id.cmp(&b.id)));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn mark_done(&self, id: i64, status: Option<&str>, detail: &str) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| DroverError::NotFound(format!("entity {id}")))?;
        if let Some(status) = status {
            row.entity.status = status.to_string();
        }
        row.entity.modified_at = Some(Utc::now());
        row.needs_action = false;
        row.last_detail = Some(detail.to_string());
        Ok(())
    }

    async fn mark_failed(&self, id: i64, detail: &str) -> Result<()> {
        self.mark_done(id, Some(FAILED_STATUS), detail).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[tokio::test]
    async fn stale_listing_skips_fresh_and_terminal_rows() {
        let store = InMemoryEntityStore::new();
        let now = Utc::now();
        store
            .upsert(TrackedEntity::new(1, "A", "running").modified(now - TimeDelta::hours(1)))
            .await;
        store
            .upsert(TrackedEntity::new(2, "A", "running").modified(now))
            .await;
        store
            .upsert(TrackedEntity::new(3, "A", "finished").modified(now - TimeDelta::hours(2)))
            .await;
        store.upsert(TrackedEntity::new(4, "B", "submitted")).await;

        let threshold = now - TimeDelta::minutes(5);
        let ids: Vec<i64> = store
            .list_stale(threshold, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[tokio::test]
    async fn mark_done_clears_the_flag() {
        let store = InMemoryEntityStore::new();
        store.upsert(TrackedEntity::new(9, "A", "running")).await;
        store.flag(9).await.unwrap();
        assert_eq!(store.fetch_candidates(5).await.unwrap().len(), 1);

        store.mark_done(9, Some("finished"), "ok").await.unwrap();
        assert!(!store.needs_action(9).await);
        assert_eq!(store.get(9).await.unwrap().status, "finished");
        assert!(store.fetch_candidates(5).await.unwrap().is_empty());
        assert!(store.flag(404).await.is_err());
    }
}
