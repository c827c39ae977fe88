//! Agent loop protocol: claim, act, re-claim, commit, release.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use drover_core::{
    agent::{ActionPlugin, ActionResult, AgentLoop, MonitorAgent, PassSummary, chunk_lease_key},
    config::{AgentConfig, MonitorConfig},
    entity::{EntityStore, InMemoryEntityStore, TrackedEntity},
    fifo::{InMemoryBackend, QueueBackend},
    lease::{HolderToken, InMemoryLeaseStore, LeaseGuard, LeaseStore, entity_key},
    monitor::MonitorQueue,
};
use tokio_util::sync::CancellationToken;

/// Returns a fixed result per entity id and counts invocations.
struct ScriptedPlugin {
    results: HashMap<i64, ActionResult>,
    calls: AtomicUsize,
}

impl ScriptedPlugin {
    fn new(results: impl IntoIterator<Item = (i64, ActionResult)>) -> Self {
        Self {
            results: results.into_iter().collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ActionPlugin for ScriptedPlugin {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn perform_action(&self, entity: &TrackedEntity) -> ActionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .get(&entity.id)
            .cloned()
            .unwrap_or_else(|| ActionResult::success("default"))
    }
}

/// Simulates a side effect that outlives its lease: another holder takes the
/// entity while the action runs.
struct StolenLeasePlugin {
    leases: Arc<dyn LeaseStore>,
    thief: HolderToken,
}

#[async_trait]
impl ActionPlugin for StolenLeasePlugin {
    fn name(&self) -> &str {
        "slow"
    }

    async fn perform_action(&self, entity: &TrackedEntity) -> ActionResult {
        let key = entity_key("worker", entity.id);
        self.leases.force_release(&key).await.unwrap();
        self.leases
            .try_acquire(&key, &self.thief, Duration::from_secs(600))
            .await
            .unwrap();
        ActionResult::success("late")
    }
}

async fn flagged_store(ids: &[(i64, &str)]) -> Arc<InMemoryEntityStore> {
    let store = Arc::new(InMemoryEntityStore::new());
    for (id, partition) in ids {
        store
            .upsert(TrackedEntity::new(*id, *partition, "running"))
            .await;
        store.flag(*id).await.unwrap();
    }
    store
}

fn agent(
    store: Arc<InMemoryEntityStore>,
    leases: Arc<dyn LeaseStore>,
    plugin: Arc<dyn ActionPlugin>,
) -> AgentLoop {
    AgentLoop::new(
        "tester",
        store as Arc<dyn EntityStore>,
        leases,
        plugin,
        AgentConfig::default(),
    )
}

#[tokio::test]
async fn pass_applies_each_outcome() {
    let store = flagged_store(&[(1, "A"), (2, "A"), (3, "B")]).await;
    let plugin = Arc::new(ScriptedPlugin::new([
        (1, ActionResult::success("done").with_status("finished")),
        (2, ActionResult::retry("batch system busy")),
        (3, ActionResult::permanent_failure("lost on site")),
    ]));
    let leases: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
    let agent = agent(store.clone(), Arc::clone(&leases), plugin.clone());

    let summary = agent.run_once().await.unwrap();
    assert_eq!(
        summary,
        PassSummary {
            attempted: 3,
            succeeded: 1,
            retried: 1,
            failed_permanently: 1,
            skipped_contended: 0,
        }
    );

    assert_eq!(store.get(1).await.unwrap().status, "finished");
    assert!(!store.needs_action(1).await);
    assert!(store.needs_action(2).await, "retry leaves the entity untouched");
    assert_eq!(store.get(3).await.unwrap().status, "failed");
    assert_eq!(store.last_detail(3).await.as_deref(), Some("lost on site"));

    for id in [1, 2, 3] {
        assert!(leases.inspect(&entity_key("worker", id)).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn contended_entities_are_skipped_without_error() {
    let store = flagged_store(&[(42, "A")]).await;
    let leases: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
    let other = HolderToken::for_agent("other");
    assert!(leases
        .try_acquire(&entity_key("worker", 42), &other, Duration::from_secs(600))
        .await
        .unwrap());

    let plugin = Arc::new(ScriptedPlugin::new([]));
    let agent = agent(store.clone(), Arc::clone(&leases), plugin.clone());
    let summary = agent.run_once().await.unwrap();

    assert_eq!(summary.skipped_contended, 1);
    assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);
    assert!(store.needs_action(42).await);

    leases
        .release(&entity_key("worker", 42), &other)
        .await
        .unwrap();
    let summary = agent.run_once().await.unwrap();
    assert_eq!(summary.succeeded, 1);
}

#[tokio::test]
async fn lost_lease_blocks_the_commit() {
    let store = flagged_store(&[(5, "A")]).await;
    let leases: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
    let thief = HolderToken::for_agent("thief");
    let plugin = Arc::new(StolenLeasePlugin {
        leases: Arc::clone(&leases),
        thief: thief.clone(),
    });
    let agent = agent(store.clone(), Arc::clone(&leases), plugin);

    let summary = agent.run_once().await.unwrap();
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.retried, 1);
    assert!(store.needs_action(5).await, "no commit without the lease");
    let lease = leases
        .inspect(&entity_key("worker", 5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.holder, thief);
}

#[tokio::test(start_paused = true)]
async fn run_stops_when_cancelled() {
    let store = flagged_store(&[(1, "A")]).await;
    let leases: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
    let plugin = Arc::new(ScriptedPlugin::new([]));
    let agent = Arc::new(agent(store.clone(), leases, plugin.clone()));

    let shutdown = CancellationToken::new();
    let runner = {
        let agent = Arc::clone(&agent);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();
    runner.await.unwrap().unwrap();

    assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
    assert!(!store.needs_action(1).await);
}

#[tokio::test]
async fn monitor_agent_checks_due_chunks_and_requeues_them() {
    let store = Arc::new(InMemoryEntityStore::new());
    let old = Utc::now() - TimeDelta::hours(2);
    for (id, partition) in [(1, "A"), (2, "A"), (3, "B")] {
        store
            .upsert(TrackedEntity::new(id, partition, "running").modified(old))
            .await;
    }

    let config = MonitorConfig {
        max_workers_per_chunk: 2,
        ..MonitorConfig::default()
    };
    let backend = Arc::new(InMemoryBackend::new("monitor"));
    let queue = MonitorQueue::new(backend.clone() as Arc<dyn QueueBackend>, config);
    queue
        .populate(store.as_ref(), Duration::from_secs(60), false)
        .await
        .unwrap();

    let plugin = Arc::new(ScriptedPlugin::new([]));
    let agent = MonitorAgent::new(
        "monitor",
        queue,
        store.clone() as Arc<dyn EntityStore>,
        Arc::new(InMemoryLeaseStore::new()),
        plugin.clone(),
        AgentConfig::default(),
    );

    let summary = agent.run_once().await.unwrap();
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(plugin.calls.load(Ordering::SeqCst), 3);

    // Both chunks went back, due one check interval from now.
    assert_eq!(agent.queue().fifo().size().await.unwrap(), 2);
    assert_eq!(backend.held().await, 0);
    assert!(!agent
        .queue()
        .due_to_check(Duration::from_secs(300))
        .await
        .unwrap()
        .is_due());
    assert!(store.get(1).await.unwrap().modified_at.unwrap() > old);
}

#[tokio::test]
async fn monitor_agent_recovers_chunks_left_held() {
    let store = Arc::new(InMemoryEntityStore::new());
    store
        .upsert(
            TrackedEntity::new(1, "A", "running").modified(Utc::now() - TimeDelta::hours(1)),
        )
        .await;
    let backend = Arc::new(InMemoryBackend::new("monitor"));
    let queue = MonitorQueue::new(
        backend.clone() as Arc<dyn QueueBackend>,
        MonitorConfig::default(),
    );
    queue
        .populate(store.as_ref(), Duration::from_secs(60), false)
        .await
        .unwrap();

    // A previous run crashed after its protective get.
    queue.fifo().get(None, true).await.unwrap().unwrap();
    assert_eq!(backend.held().await, 1);

    let agent = MonitorAgent::new(
        "monitor",
        queue,
        store.clone() as Arc<dyn EntityStore>,
        Arc::new(InMemoryLeaseStore::new()),
        Arc::new(ScriptedPlugin::new([])),
        AgentConfig::default(),
    );
    assert_eq!(agent.recover().await.unwrap(), 1);
    assert_eq!(agent.run_once().await.unwrap().succeeded, 1);
}

async fn stale_store(entities: &[(i64, &str)]) -> Arc<InMemoryEntityStore> {
    let store = Arc::new(InMemoryEntityStore::new());
    for (id, partition) in entities {
        store
            .upsert(
                TrackedEntity::new(*id, *partition, "running")
                    .modified(Utc::now() - TimeDelta::hours(1)),
            )
            .await;
    }
    store
}

async fn monitor_agent(
    name: &str,
    store: Arc<InMemoryEntityStore>,
    leases: Arc<dyn LeaseStore>,
    plugin: Arc<dyn ActionPlugin>,
) -> (MonitorAgent, Arc<InMemoryBackend>) {
    let backend = Arc::new(InMemoryBackend::new("monitor"));
    let queue = MonitorQueue::new(
        backend.clone() as Arc<dyn QueueBackend>,
        MonitorConfig::default(),
    );
    queue
        .populate(store.as_ref(), Duration::from_secs(60), false)
        .await
        .unwrap();
    let agent = MonitorAgent::new(
        name,
        queue,
        store as Arc<dyn EntityStore>,
        leases,
        plugin,
        AgentConfig::default(),
    );
    (agent, backend)
}

#[tokio::test]
async fn monitor_agent_drops_chunk_once_its_entities_fail() {
    let store = stale_store(&[(1, "A")]).await;
    let plugin = Arc::new(ScriptedPlugin::new([(
        1,
        ActionResult::permanent_failure("lost on site"),
    )]));
    let (agent, backend) = monitor_agent(
        "monitor",
        store.clone(),
        Arc::new(InMemoryLeaseStore::new()),
        plugin.clone(),
    )
    .await;
    let chunk_id = agent.queue().fifo().peek().await.unwrap().unwrap().id;

    let summary = agent.run_once().await.unwrap();
    assert_eq!(summary.failed_permanently, 1);
    assert_eq!(store.get(1).await.unwrap().status, "failed");
    assert_eq!(agent.queue().fifo().size().await.unwrap(), 0);
    assert_eq!(backend.held().await, 0);

    // Nothing left to preempt or check.
    assert!(!agent.queue().preempt(chunk_id).await.unwrap());
    assert_eq!(agent.run_once().await.unwrap().attempted, 0);
    assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn monitor_agent_requeues_only_unsettled_entities() {
    let store = stale_store(&[(1, "A"), (2, "A"), (3, "A"), (4, "A")]).await;
    let plugin = Arc::new(ScriptedPlugin::new([
        (1, ActionResult::permanent_failure("lost on site")),
        (2, ActionResult::success("done").with_status("finished")),
        (3, ActionResult::success("polled").with_status("submitted")),
        (4, ActionResult::retry("batch system busy")),
    ]));
    let (agent, _backend) = monitor_agent(
        "monitor",
        store.clone(),
        Arc::new(InMemoryLeaseStore::new()),
        plugin.clone(),
    )
    .await;

    agent.run_once().await.unwrap();

    let requeued = agent.queue().fifo().peek().await.unwrap().unwrap();
    let mut kept: Vec<(i64, String)> = requeued
        .item
        .entities
        .iter()
        .map(|e| (e.id, e.status.clone()))
        .collect();
    kept.sort();
    assert_eq!(
        kept,
        vec![(3, "submitted".to_string()), (4, "running".to_string())]
    );
    assert_eq!(agent.queue().fifo().size().await.unwrap(), 1);

    // A preempted chunk is checked again, without the settled entities.
    assert!(agent.queue().preempt(requeued.id).await.unwrap());
    assert_eq!(agent.run_once().await.unwrap().attempted, 2);
    assert_eq!(plugin.calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn recover_leaves_chunks_held_by_a_live_agent() {
    let store = stale_store(&[(1, "A")]).await;
    let leases: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
    let (agent, backend) = monitor_agent(
        "monitor-b",
        store.clone(),
        Arc::clone(&leases),
        Arc::new(ScriptedPlugin::new([])),
    )
    .await;

    // A live peer is mid-check on the only chunk.
    let held = agent.queue().fifo().get(None, true).await.unwrap().unwrap();
    let claim = LeaseGuard::acquire(
        Arc::clone(&leases),
        chunk_lease_key("monitor", held.id),
        HolderToken::for_agent("monitor-a"),
        Duration::from_secs(600),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(agent.recover().await.unwrap(), 0);
    assert_eq!(agent.run_once().await.unwrap().attempted, 0);
    assert_eq!(backend.held().await, 1);

    // The peer finishes its check: exactly one live chunk remains.
    agent.queue().requeue(&held.item).await.unwrap();
    assert_eq!(agent.queue().fifo().delete(&[held.id]).await.unwrap(), 1);
    claim.release().await.unwrap();
    assert_eq!(agent.queue().fifo().size().await.unwrap(), 1);
    assert_eq!(backend.held().await, 0);

    // Once the holder is gone, recovery takes the chunk back.
    agent.queue().fifo().get(None, true).await.unwrap().unwrap();
    assert_eq!(agent.recover().await.unwrap(), 1);
}
