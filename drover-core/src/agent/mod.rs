//! Polling agents.
//!
//! Every agent runs the same cycle per entity: take the entity's lease, run
//! the collaborator plugin, re-validate the lease, commit, release. Losing a
//! lease race is expected and just skips the entity. A store failure ends
//! the pass; the loop retries after its regular sleep.

pub mod monitor;

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::AgentConfig,
    entity::{EntityStore, TERMINAL_STATUSES, TrackedEntity},
    error::Result,
    lease::{HolderToken, LeaseGuard, LeaseStore, entity_key},
};

pub use monitor::{CHUNK_LEASE_KIND, MonitorAgent, chunk_lease_key};

/// Lease namespace for entity rows.
pub const ENTITY_LEASE_KIND: &str = "worker";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    /// Unrecoverable; the entity moves to its failed state.
    PermanentFailure,
    /// Leave the entity untouched so the next pass tries again.
    Retry,
}

/// What a plugin reports after acting on an entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionResult {
    pub outcome: ActionOutcome,
    pub detail: String,
    /// New status to persist on success.
    pub status: Option<String>,
}

impl ActionResult {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            outcome: ActionOutcome::Success,
            detail: detail.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn permanent_failure(detail: impl Into<String>) -> Self {
        Self {
            outcome: ActionOutcome::PermanentFailure,
            detail: detail.into(),
            status: None,
        }
    }

    pub fn retry(detail: impl Into<String>) -> Self {
        Self {
            outcome: ActionOutcome::Retry,
            detail: detail.into(),
            status: None,
        }
    }
}

/// Side effect supplied by a collaborator (batch system, transfer service).
#[async_trait]
pub trait ActionPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn perform_action(&self, entity: &TrackedEntity) -> ActionResult;
}

/// Per-pass counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed_permanently: usize,
    pub skipped_contended: usize,
}

impl PassSummary {
    pub fn merge(&mut self, other: PassSummary) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.failed_permanently += other.failed_permanently;
        self.skipped_contended += other.skipped_contended;
    }
}

/// How one entity cycle ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntityOutcome {
    /// Another holder had the lease; nothing ran.
    Contended,
    /// Plugin asked for a retry, or the lease was lost before commit.
    Retried,
    /// Success persisted; `status` is the status written, if any.
    Committed { status: Option<String> },
    /// Moved to the failed state.
    Failed,
}

impl EntityOutcome {
    /// Whether the entity reached a state no agent acts on again.
    pub fn is_terminal(&self) -> bool {
        match self {
            EntityOutcome::Failed => true,
            EntityOutcome::Committed {
                status: Some(status),
            } => TERMINAL_STATUSES.contains(&status.as_str()),
            _ => false,
        }
    }
}

/// Collaborators shared by the entity cycle of every agent.
#[derive(Clone)]
pub struct ActionContext {
    pub holder: HolderToken,
    pub leases: Arc<dyn LeaseStore>,
    pub store: Arc<dyn EntityStore>,
    pub plugin: Arc<dyn ActionPlugin>,
    pub lock_interval: Duration,
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("holder", &self.holder)
            .field("plugin", &self.plugin.name())
            .field("lock_interval", &self.lock_interval)
            .finish()
    }
}

impl ActionContext {
    /// Lease, act, re-validate, commit, release for one entity.
    pub async fn process_entity(
        &self,
        entity: &TrackedEntity,
        summary: &mut PassSummary,
    ) -> Result<EntityOutcome> {
        summary.attempted += 1;
        let key = entity_key(ENTITY_LEASE_KIND, entity.id);
        let Some(guard) = LeaseGuard::acquire(
            Arc::clone(&self.leases),
            key,
            self.holder.clone(),
            self.lock_interval,
        )
        .await?
        else {
            summary.skipped_contended += 1;
            return Ok(EntityOutcome::Contended);
        };

        let result = self.plugin.perform_action(entity).await;
        if result.outcome == ActionOutcome::Retry {
            debug!(
                target: "drover::agent",
                worker_id = entity.id,
                partition = %entity.partition,
                detail = %result.detail,
                "plugin asked for retry"
            );
            summary.retried += 1;
            guard.release().await?;
            return Ok(EntityOutcome::Retried);
        }

        if !guard.revalidate().await? {
            // Someone else owns the entity now; their pass decides its state.
            summary.retried += 1;
            guard.release().await?;
            return Ok(EntityOutcome::Retried);
        }

        let outcome = match result.outcome {
            ActionOutcome::Success => {
                self.store
                    .mark_done(entity.id, result.status.as_deref(), &result.detail)
                    .await?;
                summary.succeeded += 1;
                EntityOutcome::Committed {
                    status: result.status,
                }
            }
            ActionOutcome::PermanentFailure => {
                warn!(
                    target: "drover::agent",
                    worker_id = entity.id,
                    partition = %entity.partition,
                    plugin = %self.plugin.name(),
                    detail = %result.detail,
                    "permanent failure"
                );
                self.store.mark_failed(entity.id, &result.detail).await?;
                summary.failed_permanently += 1;
                EntityOutcome::Failed
            }
            ActionOutcome::Retry => EntityOutcome::Retried,
        };
        guard.release().await?;
        Ok(outcome)
    }
}

/// Generic polling agent over an [`EntityStore`].
#[derive(Debug)]
pub struct AgentLoop {
    name: String,
    ctx: ActionContext,
    config: AgentConfig,
}

impl AgentLoop {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn EntityStore>,
        leases: Arc<dyn LeaseStore>,
        plugin: Arc<dyn ActionPlugin>,
        config: AgentConfig,
    ) -> Self {
        let name = name.into();
        let ctx = ActionContext {
            holder: HolderToken::for_agent(&name),
            leases,
            store,
            plugin,
            lock_interval: config.lock_interval(),
        };
        Self { name, ctx, config }
    }

    pub fn holder(&self) -> &HolderToken {
        &self.ctx.holder
    }

    /// One pass over every partition's candidates.
    pub async fn run_once(&self) -> Result<PassSummary> {
        let candidates = self
            .ctx
            .store
            .fetch_candidates(self.config.max_workers)
            .await?;

        let mut by_partition: BTreeMap<&str, Vec<&TrackedEntity>> = BTreeMap::new();
        for entity in &candidates {
            by_partition
                .entry(entity.partition.as_str())
                .or_default()
                .push(entity);
        }

        let mut summary = PassSummary::default();
        for (partition, entities) in by_partition {
            debug!(target: "drover::agent", agent = %self.name, %partition, count = entities.len(), "processing partition");
            for entity in entities {
                self.ctx.process_entity(entity, &mut summary).await?;
            }
        }
        Ok(summary)
    }

    /// Run passes until `shutdown` fires. The token is checked between
    /// passes; an in-flight pass always completes.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(target: "drover::agent", agent = %self.name, holder = %self.ctx.holder, "agent started");
        run_passes(&self.name, self.config.sleep_time(), shutdown, || self.run_once()).await;
        info!(target: "drover::agent", agent = %self.name, "agent stopped");
        Ok(())
    }
}

/// Shared pass/sleep loop. Errors are logged and the loop carries on after
/// the regular sleep, so a store outage never hot loops or kills the agent.
pub(crate) async fn run_passes<F, Fut>(
    name: &str,
    sleep_time: Duration,
    shutdown: CancellationToken,
    mut pass: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PassSummary>>,
{
    while !shutdown.is_cancelled() {
        match pass().await {
            Ok(summary) => {
                info!(
                    target: "drover::agent",
                    agent = %name,
                    attempted = summary.attempted,
                    succeeded = summary.succeeded,
                    retried = summary.retried,
                    failed_permanently = summary.failed_permanently,
                    skipped_contended = summary.skipped_contended,
                    "pass complete"
                );
            }
            Err(err) if err.is_transient() => {
                warn!(target: "drover::agent", agent = %name, error = %err, "pass aborted by store failure; retrying after sleep");
            }
            Err(err) => {
                error!(target: "drover::agent", agent = %name, error = %err, "pass failed");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(sleep_time) => {}
        }
    }
}
