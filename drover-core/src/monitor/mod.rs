//! Monitor-queue scheduling.
//!
//! [`MonitorQueue::populate`] turns stale tracked entities into chunks
//! ordered by due time. Pollers call [`MonitorQueue::due_to_check`] to decide
//! from a payload-free peek whether the head chunk is ready, and only then
//! dequeue it. A negative score marks a chunk preempted: it is due at once,
//! whatever its computed overhead.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::MonitorConfig,
    entity::{EntitySource, TrackedEntity},
    error::{DroverError, Result},
    fifo::{Fifo, FifoUpdate, ItemId, Mode, QueueBackend, ScoreCondition, epoch_now},
};

/// Score written by [`MonitorQueue::preempt`].
pub const PREEMPT_SCORE: f64 = -1.0;

/// One queue payload: a run of same-partition entities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub partition: String,
    pub entities: Vec<TrackedEntity>,
    /// Time of the populate pass (or requeue) that produced this chunk.
    pub last_check_at: DateTime<Utc>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Due time of a fresh chunk: its first entity's modification time in
    /// whole epoch seconds, or the current time when that is unknown.
    fn initial_score(&self, now: DateTime<Utc>) -> f64 {
        self.entities
            .first()
            .and_then(|entity| entity.modified_at)
            .unwrap_or(now)
            .timestamp() as f64
    }
}

/// Scheduling decision for the head of the monitor queue.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DueCheck {
    /// Nothing queued.
    Empty,
    /// Head chunk's due time is still ahead; `overhead` is `<= 0`.
    NotYetDue { overhead: f64 },
    /// Head chunk is overdue by `overhead` seconds.
    Due { overhead: f64 },
    /// Head chunk carries a negative score and must be checked now.
    Preempt,
}

impl DueCheck {
    /// `score < 0` is the preemption marker. It only applies while the score
    /// is behind `now`, which holds for any real clock.
    pub fn from_score(score: f64, now: f64) -> Self {
        let overhead = now - score;
        if overhead > 0.0 {
            if score < 0.0 {
                DueCheck::Preempt
            } else {
                DueCheck::Due { overhead }
            }
        } else {
            DueCheck::NotYetDue { overhead }
        }
    }

    pub fn is_due(&self) -> bool {
        matches!(self, DueCheck::Due { .. } | DueCheck::Preempt)
    }

    pub fn overhead(&self) -> Option<f64> {
        match self {
            DueCheck::NotYetDue { overhead } | DueCheck::Due { overhead } => Some(*overhead),
            DueCheck::Empty | DueCheck::Preempt => None,
        }
    }

    /// Legacy `(is_due, overhead)` pair.
    pub fn as_tuple(&self) -> (bool, Option<f64>) {
        (self.is_due(), self.overhead())
    }
}

/// Counts reported by a populate pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PopulateSummary {
    pub entities: usize,
    pub chunks: usize,
}

/// Time-ordered queue of entity chunks.
#[derive(Clone, Debug)]
pub struct MonitorQueue {
    fifo: Fifo<Chunk>,
    config: MonitorConfig,
}

impl MonitorQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, config: MonitorConfig) -> Self {
        Self {
            fifo: Fifo::new(backend),
            config,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.fifo = self.fifo.with_poll_interval(poll_interval);
        self
    }

    pub fn fifo(&self) -> &Fifo<Chunk> {
        &self.fifo
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Enqueue chunks for every entity not modified within `staleness`.
    ///
    /// Entities arrive grouped by partition in modification-time order; each
    /// contiguous same-partition run of up to `max_workers_per_chunk` becomes
    /// one chunk, and a trailing partial run is flushed too.
    pub async fn populate(
        &self,
        source: &dyn EntitySource,
        staleness: Duration,
        clear_first: bool,
    ) -> Result<PopulateSummary> {
        if clear_first {
            self.fifo.clear().await?;
        }
        let now = Utc::now();
        let staleness = TimeDelta::from_std(staleness)
            .map_err(|e| DroverError::Config(format!("staleness out of range: {e}")))?;
        let threshold = now - staleness;

        let entities = source
            .list_stale(threshold, self.config.populate_limit())
            .await?;
        let mut summary = PopulateSummary {
            entities: entities.len(),
            chunks: 0,
        };

        let max_chunk = self.config.max_workers_per_chunk.max(1);
        let mut current: Option<Chunk> = None;
        for entity in entities {
            let fits = current.as_ref().is_some_and(|chunk| {
                chunk.partition == entity.partition && chunk.len() < max_chunk
            });
            if !fits && let Some(full) = current.take() {
                self.enqueue_fresh(full, now).await?;
                summary.chunks += 1;
            }
            current
                .get_or_insert_with(|| Chunk {
                    partition: entity.partition.clone(),
                    entities: Vec::new(),
                    last_check_at: now,
                })
                .entities
                .push(entity);
        }
        if let Some(rest) = current.take() {
            self.enqueue_fresh(rest, now).await?;
            summary.chunks += 1;
        }

        info!(
            target: "drover::monitor",
            queue = %self.fifo.name(),
            entities = summary.entities,
            chunks = summary.chunks,
            clear_first,
            "populated monitor queue"
        );
        Ok(summary)
    }

    async fn enqueue_fresh(&self, chunk: Chunk, now: DateTime<Utc>) -> Result<ItemId> {
        let score = chunk.initial_score(now);
        let id = self.fifo.put(&chunk, Some(score)).await?;
        debug!(
            target: "drover::monitor",
            queue = %self.fifo.name(),
            %id,
            partition = %chunk.partition,
            size = chunk.len(),
            score,
            "chunk enqueued"
        );
        Ok(id)
    }

    /// Decide from the lowest score alone whether a chunk is ready.
    /// `check_interval` only feeds the lag warning.
    pub async fn due_to_check(&self, check_interval: Duration) -> Result<DueCheck> {
        let Some((id, score)) = self.fifo.peek_score(Mode::First).await? else {
            debug!(target: "drover::monitor", queue = %self.fifo.name(), "monitor queue empty");
            return Ok(DueCheck::Empty);
        };
        let check = DueCheck::from_score(score, epoch_now());
        match check {
            DueCheck::Preempt => {
                info!(target: "drover::monitor", queue = %self.fifo.name(), %id, "preempted chunk due now");
            }
            DueCheck::Due { overhead } if overhead > check_interval.as_secs_f64() => {
                warn!(
                    target: "drover::monitor",
                    queue = %self.fifo.name(),
                    %id,
                    overhead,
                    "monitor is lagging behind its check interval"
                );
            }
            _ => {
                debug!(target: "drover::monitor", queue = %self.fifo.name(), %id, ?check, "due check");
            }
        }
        Ok(check)
    }

    /// Force a live chunk to the head of the queue. `false` when the chunk is
    /// gone or already preempted.
    pub async fn preempt(&self, id: ItemId) -> Result<bool> {
        let applied = self
            .fifo
            .update(id, FifoUpdate::score(PREEMPT_SCORE, ScoreCondition::Lt))
            .await?;
        info!(target: "drover::monitor", queue = %self.fifo.name(), %id, applied, "preempt requested");
        Ok(applied)
    }

    /// Put a checked chunk back, due one check interval from now.
    pub async fn requeue(&self, chunk: &Chunk) -> Result<ItemId> {
        let now = epoch_now();
        let score = now + self.config.check_interval().as_secs_f64();
        let chunk = Chunk {
            last_check_at: Utc::now(),
            ..chunk.clone()
        };
        let id = self.fifo.put(&chunk, Some(score)).await?;
        debug!(target: "drover::monitor", queue = %self.fifo.name(), %id, score, "chunk requeued");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_due_time_is_not_due() {
        let check = DueCheck::from_score(1005.0, 1000.0);
        assert_eq!(check, DueCheck::NotYetDue { overhead: -5.0 });
        assert_eq!(check.as_tuple(), (false, Some(-5.0)));
    }

    #[test]
    fn negative_score_preempts_and_hides_overhead() {
        let check = DueCheck::from_score(-100.0, 1000.0);
        assert_eq!(check, DueCheck::Preempt);
        assert_eq!(check.as_tuple(), (true, None));
    }

    #[test]
    fn overdue_chunk_reports_overhead() {
        let check = DueCheck::from_score(990.0, 1000.0);
        assert_eq!(check.as_tuple(), (true, Some(10.0)));
        assert_eq!(DueCheck::Empty.as_tuple(), (false, None));
    }

    #[test]
    fn chunk_without_modtime_is_due_now() {
        let now = Utc::now();
        let chunk = Chunk {
            partition: "A".into(),
            entities: vec![TrackedEntity::new(1, "A", "running")],
            last_check_at: now,
        };
        assert_eq!(chunk.initial_score(now), now.timestamp() as f64);
    }
}
