use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context as _, Result, anyhow};
use drover_config::{ConfigLoad, ConfigLoader};
use drover_core::{
    DroverConfig, MIGRATOR,
    entity::PostgresWorkerStore,
    fifo::{Fifo, ItemId, ManyQuery, PostgresBackend, QueueBackend},
    lease::{LeaseStore, ObjectLockStore, RedisLeaseStore, WorkerRowLeaseStore},
    monitor::{Chunk, DueCheck, MonitorQueue},
};
use serde_json::json;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub enum LeaseBackend {
    Object,
    Worker,
    Redis,
}

#[derive(Debug)]
pub struct Context {
    config: DroverConfig,
    database_url: Option<String>,
    redis_url: Option<String>,
}

impl Context {
    pub fn load(
        config_path: Option<&Path>,
        env_file: Option<&Path>,
        database_url: Option<String>,
    ) -> Result<Self> {
        let mut loader = ConfigLoader::new();
        if let Some(path) = config_path {
            loader = loader.with_config_path(path);
        }
        if let Some(path) = env_file {
            loader = loader.with_env_file(path);
        }
        let ConfigLoad {
            config,
            source,
            database_url: env_database_url,
            redis_url,
            ..
        } = loader.load().context("failed to load drover configuration")?;
        info!(?source, "configuration loaded");

        Ok(Self {
            config,
            database_url: database_url.or(env_database_url),
            redis_url,
        })
    }

    async fn pool(&self) -> Result<PgPool> {
        let url = self
            .database_url
            .as_deref()
            .ok_or_else(|| anyhow!("DATABASE_URL is not set; pass --database-url"))?;
        PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .context("failed to connect to Postgres")
    }

    fn queue_name(&self, queue: Option<String>) -> String {
        queue.unwrap_or_else(|| self.config.monitor.active_queue_name().to_string())
    }

    async fn backend(&self, queue: Option<String>) -> Result<Arc<dyn QueueBackend>> {
        self.backend_on(self.pool().await?, queue).await
    }

    async fn backend_on(
        &self,
        pool: PgPool,
        queue: Option<String>,
    ) -> Result<Arc<dyn QueueBackend>> {
        let backend = PostgresBackend::new(pool, self.queue_name(queue)).await?;
        Ok(Arc::new(backend))
    }

    async fn monitor_on(&self, pool: PgPool) -> Result<MonitorQueue> {
        Ok(MonitorQueue::new(
            self.backend_on(pool, None).await?,
            self.config.monitor.clone(),
        ))
    }

    async fn monitor(&self) -> Result<MonitorQueue> {
        self.monitor_on(self.pool().await?).await
    }

    async fn lease_store(&self, backend: LeaseBackend) -> Result<Box<dyn LeaseStore>> {
        let store: Box<dyn LeaseStore> = match backend {
            LeaseBackend::Object => Box::new(ObjectLockStore::new(self.pool().await?)),
            LeaseBackend::Worker => Box::new(WorkerRowLeaseStore::new(
                self.pool().await?,
                self.config.agent.lock_interval(),
            )),
            LeaseBackend::Redis => {
                let url = self
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("REDIS_URL is not set"))?;
                Box::new(RedisLeaseStore::connect(url).await?)
            }
        };
        Ok(store)
    }
}

fn item_ids(ids: &[i64]) -> Vec<ItemId> {
    ids.iter().copied().map(ItemId).collect()
}

pub async fn migrate(ctx: &Context) -> Result<()> {
    let pool = ctx.pool().await?;
    MIGRATOR
        .run(&pool)
        .await
        .context("failed to apply migrations")?;
    println!("migrations applied");
    Ok(())
}

pub async fn size(ctx: &Context, queue: Option<String>) -> Result<()> {
    let backend = ctx.backend(queue).await?;
    let size = backend.size().await?;
    println!("{}", json!({ "queue": backend.name(), "size": size }));
    Ok(())
}

pub async fn peek(ctx: &Context, queue: Option<String>, count: usize) -> Result<()> {
    let fifo: Fifo<Chunk> = Fifo::new(ctx.backend(queue).await?);
    let batch = fifo.peek_many(ManyQuery::first(count)).await?;
    for item in &batch.items {
        println!(
            "{}",
            json!({
                "id": item.id.0,
                "score": item.score,
                "partition": item.item.partition,
                "entities": item.item.len(),
                "last_check_at": item.item.last_check_at,
            })
        );
    }
    for bad in &batch.undecodable {
        println!(
            "{}",
            json!({ "id": bad.id.0, "score": bad.score, "error": bad.message })
        );
    }
    Ok(())
}

pub async fn populate(ctx: &Context, staleness_secs: u64, clear_first: bool) -> Result<()> {
    let pool = ctx.pool().await?;
    let queue = ctx.monitor_on(pool.clone()).await?;
    let source = PostgresWorkerStore::new(pool);
    let summary = queue
        .populate(&source, Duration::from_secs(staleness_secs), clear_first)
        .await?;
    println!(
        "{}",
        json!({ "entities": summary.entities, "chunks": summary.chunks })
    );
    Ok(())
}

pub async fn due(ctx: &Context) -> Result<()> {
    let queue = ctx.monitor().await?;
    let check = queue
        .due_to_check(ctx.config.monitor.check_interval())
        .await?;
    let state = match check {
        DueCheck::Empty => "empty",
        DueCheck::NotYetDue { .. } => "not_yet_due",
        DueCheck::Due { .. } => "due",
        DueCheck::Preempt => "preempt",
    };
    println!(
        "{}",
        json!({ "state": state, "due": check.is_due(), "overhead": check.overhead() })
    );
    Ok(())
}

pub async fn preempt(ctx: &Context, id: i64) -> Result<()> {
    let queue = ctx.monitor().await?;
    let applied = queue.preempt(ItemId(id)).await?;
    println!("{}", json!({ "id": id, "preempted": applied }));
    Ok(())
}

pub async fn restore(ctx: &Context, queue: Option<String>, ids: Vec<i64>) -> Result<()> {
    let backend = ctx.backend(queue).await?;
    let ids = item_ids(&ids);
    let restored = if ids.is_empty() {
        backend.restore(None).await?
    } else {
        backend.restore(Some(&ids)).await?
    };
    println!("{}", json!({ "queue": backend.name(), "restored": restored }));
    Ok(())
}

pub async fn delete(ctx: &Context, queue: Option<String>, ids: Vec<i64>) -> Result<()> {
    let backend = ctx.backend(queue).await?;
    let removed = backend.delete(&item_ids(&ids)).await?;
    println!(
        "{}",
        json!({ "queue": backend.name(), "requested": ids.len(), "deleted": removed })
    );
    Ok(())
}

pub async fn lease_show(ctx: &Context, key: &str, backend: LeaseBackend) -> Result<()> {
    let store = ctx.lease_store(backend).await?;
    match store.inspect(key).await? {
        Some(lease) => println!(
            "{}",
            json!({
                "key": lease.key,
                "holder": lease.holder.as_str(),
                "expires_at": lease.expires_at,
            })
        ),
        None => println!("{}", json!({ "key": key, "holder": null })),
    }
    Ok(())
}

pub async fn lease_release(ctx: &Context, key: &str, backend: LeaseBackend) -> Result<()> {
    let store = ctx.lease_store(backend).await?;
    let released = store.force_release(key).await?;
    info!(%key, ?backend, released, "forced lease release");
    println!("{}", json!({ "key": key, "released": released }));
    Ok(())
}
