//! Postgres backends. Run with `DATABASE_URL` set and `--ignored`.
#![cfg(feature = "database")]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{TimeDelta, Utc};
use drover_core::{
    config::MonitorConfig,
    entity::{EntityStore, PostgresWorkerStore},
    fifo::{Fifo, FifoUpdate, ItemId, ManyQuery, PostgresBackend, QueueBackend, ScoreCondition},
    lease::{HolderToken, LeaseStore, ObjectLockStore, WorkerRowLeaseStore, entity_key},
    monitor::MonitorQueue,
};
use sqlx::PgPool;

async fn fifo(pool: &PgPool, name: &str) -> Result<Fifo<String>> {
    let backend = PostgresBackend::new(pool.clone(), name).await?;
    Ok(Fifo::new(Arc::new(backend) as Arc<dyn QueueBackend>))
}

async fn seed_worker(
    pool: &PgPool,
    id: i64,
    partition: &str,
    modified_at: Option<chrono::DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO workers (id, partition_key, status, modified_at, needs_action) VALUES ($1, $2, 'running', $3, TRUE)",
    )
    .bind(id)
    .bind(partition)
    .bind(modified_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[sqlx::test(migrator = "drover_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn queue_pops_by_score_and_restores(pool: PgPool) -> Result<()> {
    let queue = fifo(&pool, "jobs").await?;
    queue.put(&"late".to_string(), Some(30.0)).await?;
    let early = queue.put(&"early".to_string(), Some(10.0)).await?;

    let held = queue.get(None, true).await?.expect("item");
    assert_eq!(held.id, early);
    assert_eq!(queue.size().await?, 1);

    assert_eq!(queue.restore(Some(&[held.id, ItemId(-1)])).await?, 1);
    let again = queue.get(None, false).await?.expect("restored");
    assert_eq!((again.id, again.score), (early, 10.0));
    assert_eq!(queue.delete(&[early]).await?, 0);
    Ok(())
}

#[sqlx::test(migrator = "drover_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn queues_are_isolated_by_name(pool: PgPool) -> Result<()> {
    let a = fifo(&pool, "a").await?;
    let b = fifo(&pool, "b").await?;
    a.put(&"x".to_string(), None).await?;
    assert_eq!(b.size().await?, 0);
    b.clear().await?;
    assert_eq!(a.size().await?, 1);
    Ok(())
}

#[sqlx::test(migrator = "drover_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn update_guard_and_bulk_reads(pool: PgPool) -> Result<()> {
    let queue = fifo(&pool, "bulk").await?;
    for score in [1.0, 2.0, 3.0] {
        queue.put(&format!("s{score}"), Some(score)).await?;
    }
    let head = queue.peek().await?.expect("head");
    assert!(!queue
        .update(head.id, FifoUpdate::score(0.5, ScoreCondition::Gt))
        .await?);
    assert!(queue
        .update(head.id, FifoUpdate::score(5.0, ScoreCondition::Gt))
        .await?);

    let batch = queue.get_many(ManyQuery::first(2).protective()).await?;
    let scores: Vec<f64> = batch.items.iter().map(|item| item.score).collect();
    assert_eq!(scores, vec![2.0, 3.0]);
    let recovered = queue
        .get_many(ManyQuery::first(10).from_holding_area())
        .await?;
    assert_eq!(recovered.items.len(), 2);
    assert_eq!(queue.size().await?, 1);
    Ok(())
}

#[sqlx::test(migrator = "drover_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn object_locks_allow_one_holder(pool: PgPool) -> Result<()> {
    let store = ObjectLockStore::new(pool);
    let a = HolderToken::from_raw("a");
    let b = HolderToken::from_raw("b");
    let ttl = Duration::from_secs(60);

    assert!(store.try_acquire("transfer:9", &a, ttl).await?);
    assert!(!store.try_acquire("transfer:9", &b, ttl).await?);
    assert!(store.try_acquire("transfer:9", &a, ttl).await?);
    assert!(!store.release("transfer:9", &b).await?);
    assert!(store.release("transfer:9", &a).await?);

    assert!(store.try_acquire("transfer:9", &b, Duration::from_millis(1)).await?);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(store.inspect("transfer:9").await?.is_none());
    assert!(store.try_acquire("transfer:9", &a, ttl).await?);
    Ok(())
}

#[sqlx::test(migrator = "drover_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn worker_row_lease_and_commit(pool: PgPool) -> Result<()> {
    seed_worker(&pool, 42, "CERN", None).await?;
    let ttl = Duration::from_secs(600);
    let leases = WorkerRowLeaseStore::new(pool.clone(), ttl);
    let a = HolderToken::from_raw("agent-a");
    let b = HolderToken::from_raw("agent-b");
    let key = entity_key("worker", 42);

    assert!(leases.try_acquire(&key, &a, ttl).await?);
    assert!(!leases.try_acquire(&key, &b, ttl).await?);
    assert_eq!(leases.inspect(&key).await?.expect("held").holder, a);
    assert!(!leases.try_acquire(&entity_key("worker", 7), &a, ttl).await?);

    let store = PostgresWorkerStore::new(pool.clone());
    assert_eq!(store.fetch_candidates(10).await?.len(), 1);
    store.mark_done(42, Some("finished"), "ok").await?;
    assert!(store.fetch_candidates(10).await?.is_empty());

    assert!(leases.release(&key, &a).await?);
    assert!(leases.try_acquire(&key, &b, ttl).await?);
    assert!(leases.force_release(&key).await?);
    Ok(())
}

#[sqlx::test(migrator = "drover_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn monitor_populates_from_workers_table(pool: PgPool) -> Result<()> {
    let old = Utc::now() - TimeDelta::hours(3);
    seed_worker(&pool, 1, "A", Some(old)).await?;
    seed_worker(&pool, 2, "A", Some(old + TimeDelta::minutes(1))).await?;
    seed_worker(&pool, 3, "B", None).await?;
    seed_worker(&pool, 4, "B", Some(Utc::now())).await?;

    let backend = PostgresBackend::new(pool.clone(), "monitor").await?;
    let queue = MonitorQueue::new(
        Arc::new(backend) as Arc<dyn QueueBackend>,
        MonitorConfig::default(),
    );
    let source = PostgresWorkerStore::new(pool);
    let summary = queue
        .populate(&source, Duration::from_secs(600), true)
        .await?;
    assert_eq!(summary.entities, 3);
    assert_eq!(summary.chunks, 2);

    let head = queue.fifo().get(None, false).await?.expect("chunk");
    assert_eq!(head.item.partition, "A");
    assert_eq!(head.score, old.timestamp() as f64);
    Ok(())
}
