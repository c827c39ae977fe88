use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use tokio::sync::Mutex;

use crate::error::Result;

use super::{ItemId, ItemUpdate, ManyQuery, Mode, RawItem, ScoreRange, backend::QueueBackend};

/// Live items are ordered by score, then by insertion sequence.
type OrderKey = (OrderedFloat<f64>, u64);

#[derive(Debug)]
struct Entry {
    payload: Vec<u8>,
    score: f64,
    temporary: bool,
    seq: u64,
}

impl Entry {
    fn key(&self) -> OrderKey {
        (OrderedFloat(self.score), self.seq)
    }

    fn raw(&self, id: ItemId, skip_item: bool) -> RawItem {
        RawItem {
            id,
            payload: (!skip_item).then(|| self.payload.clone()),
            score: self.score,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<ItemId, Entry>,
    live: BTreeMap<OrderKey, ItemId>,
    next_id: i64,
    next_seq: u64,
}

impl MemoryState {
    fn allocate_id(&mut self) -> ItemId {
        loop {
            self.next_id += 1;
            let id = ItemId(self.next_id);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(&mut self, id: ItemId, payload: Vec<u8>, score: f64) {
        self.next_seq += 1;
        let entry = Entry {
            payload,
            score,
            temporary: false,
            seq: self.next_seq,
        };
        self.live.insert(entry.key(), id);
        self.entries.insert(id, entry);
    }

    fn hold(&mut self, id: ItemId) -> Option<RawItem> {
        let entry = self.entries.get_mut(&id)?;
        if !entry.temporary {
            self.live.remove(&entry.key());
            entry.temporary = true;
        }
        Some(entry.raw(id, false))
    }

    fn remove(&mut self, id: ItemId) -> Option<RawItem> {
        let entry = self.entries.remove(&id)?;
        if !entry.temporary {
            self.live.remove(&entry.key());
        }
        Some(RawItem {
            id,
            payload: Some(entry.payload),
            score: entry.score,
        })
    }

    fn release_to_live(&mut self, id: ItemId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.temporary => {
                entry.temporary = false;
                self.live.insert(entry.key(), id);
                true
            }
            _ => false,
        }
    }

    fn end_of_live(&self, mode: Mode) -> Option<ItemId> {
        match mode {
            Mode::First => self.live.values().next().copied(),
            Mode::Last => self.live.values().next_back().copied(),
        }
    }

    fn select(
        &self,
        temporary: bool,
        mode: Mode,
        range: ScoreRange,
        count: Option<usize>,
    ) -> Vec<ItemId> {
        let mut ordered: Vec<(OrderKey, ItemId)> = if temporary {
            let mut held: Vec<_> = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.temporary)
                .map(|(id, entry)| (entry.key(), *id))
                .collect();
            held.sort_unstable_by_key(|(key, _)| *key);
            held
        } else {
            self.live.iter().map(|(key, id)| (*key, *id)).collect()
        };
        if mode == Mode::Last {
            ordered.reverse();
        }
        ordered
            .into_iter()
            .filter(|((score, _), _)| range.contains(score.0))
            .map(|(_, id)| id)
            .take(count.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Process-local backend. Clones share the same queue, which lets tests run
/// several consumers against one store.
#[derive(Clone)]
pub struct InMemoryBackend {
    name: Arc<str>,
    state: Arc<Mutex<MemoryState>>,
}

impl fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryBackend");
        debug.field("name", &self.name);
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("live", &state.live.len())
                    .field("held", &(state.entries.len() - state.live.len()));
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Number of items currently in the holding area.
    pub async fn held(&self) -> usize {
        let state = self.state.lock().await;
        state.entries.len() - state.live.len()
    }
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.state.lock().await.live.len())
    }

    async fn insert(&self, payload: Vec<u8>, score: f64) -> Result<ItemId> {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.insert(id, payload, score);
        Ok(id)
    }

    async fn insert_by_id(&self, id: ItemId, payload: Vec<u8>, score: f64) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&id) {
            return Ok(false);
        }
        state.insert(id, payload, score);
        Ok(true)
    }

    async fn pop(&self, mode: Mode, protective: bool) -> Result<Option<RawItem>> {
        let mut state = self.state.lock().await;
        let Some(id) = state.end_of_live(mode) else {
            return Ok(None);
        };
        Ok(if protective {
            state.hold(id)
        } else {
            state.remove(id)
        })
    }

    async fn pop_many(&self, query: &ManyQuery) -> Result<Vec<RawItem>> {
        let mut state = self.state.lock().await;
        let ids = state.select(query.temporary, query.mode, query.range, query.count);
        let popped = ids
            .into_iter()
            .filter_map(|id| {
                if query.protective {
                    state.hold(id)
                } else {
                    state.remove(id)
                }
            })
            .collect();
        Ok(popped)
    }

    async fn peek(&self, mode: Mode, skip_item: bool) -> Result<Option<RawItem>> {
        let state = self.state.lock().await;
        Ok(state
            .end_of_live(mode)
            .and_then(|id| state.entries.get(&id).map(|entry| entry.raw(id, skip_item))))
    }

    async fn peek_by_id(
        &self,
        id: ItemId,
        temporary: bool,
        skip_item: bool,
    ) -> Result<Option<RawItem>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .get(&id)
            .filter(|entry| entry.temporary == temporary)
            .map(|entry| entry.raw(id, skip_item)))
    }

    async fn peek_many(
        &self,
        mode: Mode,
        range: ScoreRange,
        count: Option<usize>,
        skip_item: bool,
    ) -> Result<Vec<RawItem>> {
        let state = self.state.lock().await;
        Ok(state
            .select(false, mode, range, count)
            .into_iter()
            .filter_map(|id| state.entries.get(&id).map(|entry| entry.raw(id, skip_item)))
            .collect())
    }

    async fn delete(&self, ids: &[ItemId]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        for id in ids {
            let held = state.entries.get(id).is_some_and(|entry| entry.temporary);
            if held && state.remove(*id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn restore(&self, ids: Option<&[ItemId]>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let targets: Vec<ItemId> = match ids {
            Some(ids) => ids.to_vec(),
            None => state
                .entries
                .iter()
                .filter(|(_, entry)| entry.temporary)
                .map(|(id, _)| *id)
                .collect(),
        };
        Ok(targets
            .into_iter()
            .filter(|id| state.release_to_live(*id))
            .count())
    }

    async fn update(&self, id: ItemId, update: ItemUpdate) -> Result<bool> {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let Some(entry) = state.entries.get_mut(&id) else {
            return Ok(false);
        };
        if let Some(score) = update.score
            && !update.condition.allows(entry.score, score)
        {
            return Ok(false);
        }

        if !entry.temporary {
            state.live.remove(&entry.key());
        }
        if let Some(payload) = update.payload {
            entry.payload = payload;
        }
        if let Some(score) = update.score {
            entry.score = score;
        }
        if let Some(temporary) = update.temporary {
            entry.temporary = temporary;
        }
        if !entry.temporary {
            state.live.insert(entry.key(), id);
        }
        Ok(true)
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.live.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(tag: &str) -> Vec<u8> {
        tag.as_bytes().to_vec()
    }

    #[tokio::test]
    async fn equal_scores_pop_in_insertion_order() {
        let backend = InMemoryBackend::new("ties");
        let a = backend.insert(bytes("a"), 5.0).await.unwrap();
        let b = backend.insert(bytes("b"), 5.0).await.unwrap();
        let c = backend.insert(bytes("c"), 5.0).await.unwrap();

        let order: Vec<ItemId> = vec![
            backend.pop(Mode::First, false).await.unwrap().unwrap().id,
            backend.pop(Mode::First, false).await.unwrap().unwrap().id,
            backend.pop(Mode::First, false).await.unwrap().unwrap().id,
        ];
        assert_eq!(order, vec![a, b, c]);
    }

    #[tokio::test]
    async fn allocated_ids_skip_caller_ids() {
        let backend = InMemoryBackend::new("ids");
        assert!(backend.insert_by_id(ItemId(1), bytes("x"), 1.0).await.unwrap());
        let allocated = backend.insert(bytes("y"), 2.0).await.unwrap();
        assert_ne!(allocated, ItemId(1));
        assert!(!backend.insert_by_id(allocated, bytes("z"), 3.0).await.unwrap());
    }

    #[tokio::test]
    async fn update_moves_between_live_and_held() {
        let backend = InMemoryBackend::new("moves");
        let id = backend.insert(bytes("a"), 1.0).await.unwrap();
        let hold = ItemUpdate {
            temporary: Some(true),
            ..ItemUpdate::default()
        };
        assert!(backend.update(id, hold).await.unwrap());
        assert_eq!(backend.size().await.unwrap(), 0);
        assert_eq!(backend.held().await, 1);

        let release = ItemUpdate {
            temporary: Some(false),
            score: Some(9.0),
            condition: crate::fifo::ScoreCondition::Gt,
            ..ItemUpdate::default()
        };
        assert!(backend.update(id, release).await.unwrap());
        let peeked = backend.peek(Mode::First, true).await.unwrap().unwrap();
        assert_eq!(peeked.score, 9.0);
        assert!(peeked.payload.is_none());
    }
}
