//! Score-ordered work queues.
//!
//! Despite the name, a FIFO here dequeues by ascending (or descending) score,
//! never by insertion order. Scores are usually due times in epoch seconds.
//! Protective dequeues move an item into a per-queue holding area instead of
//! deleting it, so a consumer that crashes mid-flight leaves the item behind
//! for [`Fifo::restore`].

pub mod backend;
pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use std::{fmt, marker::PhantomData, str::FromStr, sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    codec::{Codec, JsonCodec},
    error::{DroverError, Result},
};

pub use backend::QueueBackend;
pub use memory::InMemoryBackend;
#[cfg(feature = "database")]
pub use postgres::PostgresBackend;

/// Identifier of an item inside one named queue.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current wall-clock time as a queue score (epoch seconds, sub-second precision).
pub fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Item as a backend stores it. `payload` is `None` only when the caller asked
/// to skip the payload on a peek.
#[derive(Clone, Debug, PartialEq)]
pub struct RawItem {
    pub id: ItemId,
    pub payload: Option<Vec<u8>>,
    pub score: f64,
}

/// Decoded queue item handed to consumers.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueItem<T> {
    pub id: ItemId,
    pub item: T,
    pub score: f64,
}

/// Which end of the score order an operation starts from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Lowest score first.
    #[default]
    First,
    /// Highest score first.
    Last,
}

/// Inclusive score bounds; `None` leaves that side open.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScoreRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ScoreRange {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, score: f64) -> bool {
        self.min.is_none_or(|min| score >= min) && self.max.is_none_or(|max| score <= max)
    }
}

/// Guard applied by [`Fifo::update`] when a new score is supplied. The write
/// only lands when `new <op> current` holds, so a holder with a stale view
/// cannot move a score backwards over a fresher concurrent write.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreCondition {
    #[default]
    Gt,
    Ge,
    Lt,
    Le,
    Always,
}

impl ScoreCondition {
    pub fn allows(self, current: f64, new: f64) -> bool {
        match self {
            ScoreCondition::Gt => new > current,
            ScoreCondition::Ge => new >= current,
            ScoreCondition::Lt => new < current,
            ScoreCondition::Le => new <= current,
            ScoreCondition::Always => true,
        }
    }
}

impl FromStr for ScoreCondition {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gt" => Ok(ScoreCondition::Gt),
            "ge" => Ok(ScoreCondition::Ge),
            "lt" => Ok(ScoreCondition::Lt),
            "le" => Ok(ScoreCondition::Le),
            "always" | "none" => Ok(ScoreCondition::Always),
            other => Err(DroverError::Config(format!(
                "unknown score condition '{other}'"
            ))),
        }
    }
}

/// Bulk selection shared by `get_many` and `peek_many`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ManyQuery {
    pub mode: Mode,
    pub range: ScoreRange,
    /// Upper bound on the number of items returned; `None` takes all matches.
    pub count: Option<usize>,
    /// Move popped items to the holding area instead of deleting them.
    pub protective: bool,
    /// Read from the holding area instead of the live queue.
    pub temporary: bool,
}

impl ManyQuery {
    pub fn first(count: usize) -> Self {
        Self {
            count: Some(count),
            ..Self::default()
        }
    }

    pub fn in_range(mut self, range: ScoreRange) -> Self {
        self.range = range;
        self
    }

    pub fn protective(mut self) -> Self {
        self.protective = true;
        self
    }

    pub fn from_holding_area(mut self) -> Self {
        self.temporary = true;
        self
    }
}

/// Raw conditional mutation forwarded to a backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemUpdate {
    pub payload: Option<Vec<u8>>,
    pub score: Option<f64>,
    pub temporary: Option<bool>,
    pub condition: ScoreCondition,
}

/// Typed mutation accepted by [`Fifo::update`].
#[derive(Clone, Debug)]
pub struct FifoUpdate<T> {
    pub item: Option<T>,
    pub score: Option<f64>,
    pub temporary: Option<bool>,
    pub condition: ScoreCondition,
}

impl<T> Default for FifoUpdate<T> {
    fn default() -> Self {
        Self {
            item: None,
            score: None,
            temporary: None,
            condition: ScoreCondition::default(),
        }
    }
}

impl<T> FifoUpdate<T> {
    pub fn score(score: f64, condition: ScoreCondition) -> Self {
        Self {
            score: Some(score),
            condition,
            ..Self::default()
        }
    }
}

/// Stored item whose payload failed to decode. It stays in the store.
#[derive(Clone, Debug, PartialEq)]
pub struct Undecodable {
    pub id: ItemId,
    pub score: f64,
    pub message: String,
}

/// Result of a bulk read: decoded items plus per-item decode failures.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch<T> {
    pub items: Vec<QueueItem<T>>,
    pub undecodable: Vec<Undecodable>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            undecodable: Vec::new(),
        }
    }
}

impl<T> Batch<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.undecodable.is_empty()
    }
}

/// Typed queue façade over a [`QueueBackend`].
///
/// Consumer-facing pops always go through the holding area first: the item is
/// moved aside, decoded, and only then deleted for a non-protective caller.
/// An undecodable payload therefore stays held for inspection instead of
/// vanishing with a destructive pop.
pub struct Fifo<T, C = JsonCodec> {
    backend: Arc<dyn QueueBackend>,
    codec: C,
    poll_interval: Duration,
    _payload: PhantomData<fn() -> T>,
}

impl<T, C: Clone> Clone for Fifo<T, C> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            codec: self.codec.clone(),
            poll_interval: self.poll_interval,
            _payload: PhantomData,
        }
    }
}

impl<T, C> fmt::Debug for Fifo<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fifo")
            .field("queue", &self.backend.name())
            .field("codec", &std::any::type_name::<C>())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl<T> Fifo<T, JsonCodec>
where
    JsonCodec: Codec<T>,
{
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self::with_codec(backend, JsonCodec)
    }
}

impl<T, C> Fifo<T, C>
where
    C: Codec<T>,
{
    pub fn with_codec(backend: Arc<dyn QueueBackend>, codec: C) -> Self {
        Self {
            backend,
            codec,
            poll_interval: DEFAULT_POLL_INTERVAL,
            _payload: PhantomData,
        }
    }

    /// Cadence used while a blocking `get` waits for an item.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        Arc::clone(&self.backend)
    }

    /// Number of items in the live queue (held items excluded).
    pub async fn size(&self) -> Result<usize> {
        let size = self.backend.size().await?;
        debug!(target: "drover::fifo", queue = %self.name(), size, "size");
        Ok(size)
    }

    /// Enqueue `item` at `score`, defaulting to the current time.
    pub async fn put(&self, item: &T, score: Option<f64>) -> Result<ItemId> {
        let payload = self.codec.encode(item)?;
        let score = score.unwrap_or_else(epoch_now);
        let id = self.backend.insert(payload, score).await?;
        debug!(target: "drover::fifo", queue = %self.name(), %id, score, "put");
        Ok(id)
    }

    /// Enqueue under a caller-chosen id. Insert-or-ignore: returns `false` and
    /// leaves the stored item alone when `id` already exists, live or held.
    pub async fn put_by_id(
        &self,
        id: ItemId,
        item: &T,
        score: Option<f64>,
    ) -> Result<bool> {
        let payload = self.codec.encode(item)?;
        let score = score.unwrap_or_else(epoch_now);
        let inserted = self.backend.insert_by_id(id, payload, score).await?;
        debug!(target: "drover::fifo", queue = %self.name(), %id, score, inserted, "put_by_id");
        Ok(inserted)
    }

    /// Pop the lowest-scored item. With `timeout` set the call polls until an
    /// item shows up or the deadline passes; `None` or zero returns at once.
    pub async fn get(
        &self,
        timeout: Option<Duration>,
        protective: bool,
    ) -> Result<Option<QueueItem<T>>> {
        self.pop(Mode::First, timeout, protective).await
    }

    /// Pop the highest-scored item. Same semantics as [`Fifo::get`].
    pub async fn get_last(
        &self,
        timeout: Option<Duration>,
        protective: bool,
    ) -> Result<Option<QueueItem<T>>> {
        self.pop(Mode::Last, timeout, protective).await
    }

    async fn pop(
        &self,
        mode: Mode,
        timeout: Option<Duration>,
        protective: bool,
    ) -> Result<Option<QueueItem<T>>> {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);

        let raw = loop {
            if let Some(raw) = self.backend.pop(mode, true).await? {
                break raw;
            }
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(self.poll_interval.min(remaining)).await;
                }
                _ => {
                    debug!(target: "drover::fifo", queue = %self.name(), ?mode, protective, "get: empty");
                    return Ok(None);
                }
            }
        };

        let item = self.decode_raw(raw)?;
        if !protective {
            self.backend.delete(&[item.id]).await?;
        }
        debug!(target: "drover::fifo", queue = %self.name(), ?mode, id = %item.id, score = item.score, protective, "get");
        Ok(Some(item))
    }

    /// Bulk pop by score range. Decode failures are reported per item in
    /// [`Batch::undecodable`] and those items remain in the holding area.
    pub async fn get_many(&self, query: ManyQuery) -> Result<Batch<T>> {
        let held_query = ManyQuery {
            protective: true,
            ..query
        };
        let raws = self.backend.pop_many(&held_query).await?;
        let batch = self.decode_batch(raws);

        if !query.protective && !batch.items.is_empty() {
            let ids: Vec<ItemId> = batch.items.iter().map(|item| item.id).collect();
            self.backend.delete(&ids).await?;
        }

        debug!(
            target: "drover::fifo",
            queue = %self.name(),
            mode = ?query.mode,
            min = ?query.range.min,
            max = ?query.range.max,
            count = ?query.count,
            protective = query.protective,
            temporary = query.temporary,
            got = batch.items.len(),
            undecodable = batch.undecodable.len(),
            "get_many"
        );
        Ok(batch)
    }

    pub async fn peek(&self) -> Result<Option<QueueItem<T>>> {
        self.peek_end(Mode::First).await
    }

    pub async fn peek_last(&self) -> Result<Option<QueueItem<T>>> {
        self.peek_end(Mode::Last).await
    }

    async fn peek_end(&self, mode: Mode) -> Result<Option<QueueItem<T>>> {
        match self.backend.peek(mode, false).await? {
            Some(raw) => self.decode_raw(raw).map(Some),
            None => {
                debug!(target: "drover::fifo", queue = %self.name(), ?mode, "peek: fifo empty");
                Ok(None)
            }
        }
    }

    /// Id and score at one end of the live queue, without reading the payload.
    pub async fn peek_score(&self, mode: Mode) -> Result<Option<(ItemId, f64)>> {
        let peeked = self.backend.peek(mode, true).await?;
        Ok(peeked.map(|raw| (raw.id, raw.score)))
    }

    /// Look up one item by id in the live queue or, with `temporary`, the
    /// holding area.
    pub async fn peek_by_id(
        &self,
        id: ItemId,
        temporary: bool,
    ) -> Result<Option<QueueItem<T>>> {
        match self.backend.peek_by_id(id, temporary, false).await? {
            Some(raw) => self.decode_raw(raw).map(Some),
            None => Ok(None),
        }
    }

    /// Non-destructive bulk read of the live queue; `protective` and
    /// `temporary` on the query are ignored.
    pub async fn peek_many(&self, query: ManyQuery) -> Result<Batch<T>> {
        let raws = self
            .backend
            .peek_many(query.mode, query.range, query.count, false)
            .await?;
        Ok(self.decode_batch(raws))
    }

    /// Permanently remove held items. Ids that were restored or never held
    /// are ignored, so the count can be smaller than `ids.len()`.
    pub async fn delete(&self, ids: &[ItemId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.backend.delete(ids).await?;
        debug!(target: "drover::fifo", queue = %self.name(), removed, requested = ids.len(), "delete");
        Ok(removed)
    }

    /// Move held items back to the live queue with their scores preserved.
    /// `None` restores everything held. Unknown ids are a no-op.
    pub async fn restore(&self, ids: Option<&[ItemId]>) -> Result<usize> {
        let restored = self.backend.restore(ids).await?;
        match ids {
            None => debug!(target: "drover::fifo", queue = %self.name(), restored, "restored all objects"),
            Some(ids) => debug!(target: "drover::fifo", queue = %self.name(), restored, ?ids, "restored objects"),
        }
        Ok(restored)
    }

    /// Conditionally rewrite an item in place. Returns `false` when the item
    /// is missing or the score guard rejected the write; that is the
    /// lost-update case and not an error.
    pub async fn update(&self, id: ItemId, update: FifoUpdate<T>) -> Result<bool> {
        let payload = match update.item.as_ref() {
            Some(item) => Some(self.codec.encode(item)?),
            None => None,
        };
        let raw = ItemUpdate {
            payload,
            score: update.score,
            temporary: update.temporary,
            condition: update.condition,
        };
        let applied = self.backend.update(id, raw).await?;
        debug!(
            target: "drover::fifo",
            queue = %self.name(),
            %id,
            condition = ?update.condition,
            score = ?update.score,
            temporary = ?update.temporary,
            applied,
            "update"
        );
        Ok(applied)
    }

    /// Drop every item of this queue, live and held.
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await?;
        debug!(target: "drover::fifo", queue = %self.name(), "cleared");
        Ok(())
    }

    fn decode_raw(&self, raw: RawItem) -> Result<QueueItem<T>> {
        let RawItem { id, payload, score } = raw;
        let bytes = payload.ok_or_else(|| {
            DroverError::Internal(format!(
                "backend returned item {id} without payload"
            ))
        })?;
        match self.codec.decode(&bytes) {
            Ok(item) => Ok(QueueItem { id, item, score }),
            Err(err) => {
                warn!(target: "drover::fifo", queue = %self.name(), %id, error = %err, "undecodable payload left in place");
                Err(DroverError::Decode {
                    id,
                    message: err.to_string(),
                })
            }
        }
    }

    fn decode_batch(&self, raws: Vec<RawItem>) -> Batch<T> {
        let mut batch = Batch::default();
        for RawItem { id, payload, score } in raws {
            let decoded = match payload {
                Some(bytes) => self.codec.decode(&bytes).map_err(|err| err.to_string()),
                None => Err("backend returned no payload".to_string()),
            };
            match decoded {
                Ok(item) => batch.items.push(QueueItem { id, item, score }),
                Err(message) => {
                    warn!(target: "drover::fifo", queue = %self.name(), %id, error = %message, "undecodable payload left in place");
                    batch.undecodable.push(Undecodable { id, score, message });
                }
            }
        }
        batch
    }
}
