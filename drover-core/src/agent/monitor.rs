use std::{fmt, sync::Arc, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::AgentConfig,
    entity::EntityStore,
    error::{DroverError, Result},
    fifo::{ItemId, ManyQuery, QueueItem, epoch_now},
    lease::{HolderToken, LeaseGuard, LeaseStore},
    monitor::{Chunk, DueCheck, MonitorQueue},
};

use super::{ActionContext, ActionPlugin, EntityOutcome, PassSummary, run_passes};

/// Lease namespace for chunks an agent holds in the queue's holding area.
pub const CHUNK_LEASE_KIND: &str = "chunk";

/// Lease key for a held chunk, e.g. `chunk:monitor:17`.
pub fn chunk_lease_key(queue: &str, id: ItemId) -> String {
    format!("{CHUNK_LEASE_KIND}:{queue}:{id}")
}

/// Agent that drains due chunks from a [`MonitorQueue`].
///
/// Chunks are dequeued protectively and deleted only after they have been
/// requeued. While a chunk is held the agent keeps a chunk lease on it, so
/// [`recover`](MonitorAgent::recover) only returns chunks whose holder is
/// gone. Entities that reach a terminal state are dropped from the chunk.
pub struct MonitorAgent {
    name: String,
    queue: MonitorQueue,
    ctx: ActionContext,
    chunk_leases: Arc<dyn LeaseStore>,
    config: AgentConfig,
}

impl fmt::Debug for MonitorAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorAgent")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("ctx", &self.ctx)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MonitorAgent {
    /// Chunk leases go to `leases` unless
    /// [`with_chunk_leases`](MonitorAgent::with_chunk_leases) overrides it.
    pub fn new(
        name: impl Into<String>,
        queue: MonitorQueue,
        store: Arc<dyn EntityStore>,
        leases: Arc<dyn LeaseStore>,
        plugin: Arc<dyn ActionPlugin>,
        config: AgentConfig,
    ) -> Self {
        let name = name.into();
        let chunk_leases = Arc::clone(&leases);
        let ctx = ActionContext {
            holder: HolderToken::for_agent(&name),
            leases,
            store,
            plugin,
            lock_interval: config.lock_interval(),
        };
        Self {
            name,
            queue,
            ctx,
            chunk_leases,
            config,
        }
    }

    /// Keep chunk leases in a separate store. Required when entity leases
    /// live on the entity rows themselves.
    pub fn with_chunk_leases(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.chunk_leases = store;
        self
    }

    pub fn queue(&self) -> &MonitorQueue {
        &self.queue
    }

    pub fn holder(&self) -> &HolderToken {
        &self.ctx.holder
    }

    async fn claim_chunk(&self, id: ItemId) -> Result<Option<LeaseGuard>> {
        LeaseGuard::acquire(
            Arc::clone(&self.chunk_leases),
            chunk_lease_key(self.queue.fifo().name(), id),
            self.ctx.holder.clone(),
            self.ctx.lock_interval,
        )
        .await
    }

    /// Put back held chunks no live agent owns. A chunk whose lease is still
    /// held belongs to a peer mid-check and is left alone.
    pub async fn recover(&self) -> Result<usize> {
        let fifo = self.queue.fifo();
        let query = ManyQuery::default().from_holding_area().protective();
        let held = fifo.backend().pop_many(&query).await?;

        let mut restored = 0;
        for raw in held {
            let Some(claim) = self.claim_chunk(raw.id).await? else {
                debug!(target: "drover::monitor", agent = %self.name, id = %raw.id, "held chunk owned by a live agent");
                continue;
            };
            restored += fifo.restore(Some(&[raw.id])).await?;
            claim.release().await?;
        }
        if restored > 0 {
            info!(target: "drover::monitor", agent = %self.name, restored, "restored chunks from an interrupted run");
        }
        Ok(restored)
    }

    /// Drain due chunks until none is due or the per-pass budget is spent.
    pub async fn run_once(&self) -> Result<PassSummary> {
        let started = Instant::now();
        let budget = self.queue.config().fifo_check_duration();
        let check_interval = self.queue.config().check_interval();
        let mut summary = PassSummary::default();

        while started.elapsed() < budget {
            let due = self.queue.due_to_check(check_interval).await?;
            if !due.is_due() {
                break;
            }

            let held = match self.queue.fifo().get(None, true).await {
                Ok(Some(held)) => held,
                Ok(None) => break,
                Err(DroverError::Decode { id, message }) => {
                    warn!(target: "drover::monitor", agent = %self.name, %id, %message, "skipping undecodable chunk");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let Some(claim) = self.claim_chunk(held.id).await? else {
                debug!(target: "drover::monitor", agent = %self.name, id = %held.id, "chunk claimed by a recovering agent");
                continue;
            };
            // A recovery may have put the chunk back before the claim landed.
            let still_held = self
                .queue
                .fifo()
                .backend()
                .peek_by_id(held.id, true, true)
                .await?
                .is_some();
            if !still_held {
                claim.release().await?;
                continue;
            }

            // Another poller may have taken the due chunk between peek and pop.
            if !DueCheck::from_score(held.score, epoch_now()).is_due() {
                self.queue.fifo().restore(Some(&[held.id])).await?;
                claim.release().await?;
                break;
            }

            self.check_chunk(held, &claim, &mut summary).await?;
            claim.release().await?;
        }
        Ok(summary)
    }

    async fn check_chunk(
        &self,
        held: QueueItem<Chunk>,
        claim: &LeaseGuard,
        summary: &mut PassSummary,
    ) -> Result<()> {
        let QueueItem { id, item: chunk, .. } = held;
        debug!(
            target: "drover::monitor",
            agent = %self.name,
            %id,
            partition = %chunk.partition,
            size = chunk.len(),
            "checking chunk"
        );

        let mut remaining = Vec::with_capacity(chunk.len());
        for entity in &chunk.entities {
            if !claim.revalidate().await? {
                return Ok(());
            }
            let outcome = match self.ctx.process_entity(entity, summary).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.put_back(id).await;
                    return Err(err);
                }
            };
            if outcome.is_terminal() {
                debug!(target: "drover::monitor", agent = %self.name, %id, worker_id = entity.id, "entity settled; dropped from chunk");
                continue;
            }
            let mut kept = entity.clone();
            if let EntityOutcome::Committed {
                status: Some(status),
            } = outcome
            {
                kept.status = status;
            }
            remaining.push(kept);
        }

        if !claim.revalidate().await? {
            return Ok(());
        }
        if remaining.is_empty() {
            info!(target: "drover::monitor", agent = %self.name, %id, "every entity settled; chunk not requeued");
        } else {
            self.queue
                .requeue(&Chunk {
                    entities: remaining,
                    ..chunk
                })
                .await?;
        }
        self.queue.fifo().delete(&[id]).await?;
        Ok(())
    }

    async fn put_back(&self, id: ItemId) {
        if let Err(err) = self.queue.fifo().restore(Some(&[id])).await {
            warn!(target: "drover::monitor", agent = %self.name, %id, error = %err, "chunk left held; next start restores it");
        }
    }

    /// Recover, then run passes until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.recover().await?;
        info!(target: "drover::monitor", agent = %self.name, holder = %self.ctx.holder, "monitor agent started");
        run_passes(&self.name, self.sleep_time(), shutdown, || self.run_once()).await;
        info!(target: "drover::monitor", agent = %self.name, "monitor agent stopped");
        Ok(())
    }

    fn sleep_time(&self) -> Duration {
        self.config.sleep_time()
    }
}
