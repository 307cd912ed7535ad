//! Backend selection and background wiring.
//!
//! - Store: Postgres when `DATABASE_URL` is set, otherwise in-memory
//! - Queue: Redis Streams when `REDIS_URL` is set and the `redis` feature is
//!   enabled, otherwise in-memory
//! - Background: worker pool, lease reaper and outbox relay share one
//!   shutdown token

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use taskforge_ai::ExecutorRegistry;
use taskforge_events::{InMemoryTaskQueue, TaskQueue};
use taskforge_infra::{
    EngineConfig, InMemoryTaskStore, IntakeService, LeaseReaper, OutboxRelay, PostgresTaskStore,
    TaskStore, WorkerPool,
};

use crate::config::ApiConfig;

pub type SharedStore = Arc<dyn TaskStore>;
pub type SharedQueue = Arc<dyn TaskQueue>;

/// Store and queue shared by the HTTP layer and the background workers.
#[derive(Clone)]
pub struct Backends {
    pub store: SharedStore,
    pub queue: SharedQueue,
}

impl Backends {
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryTaskStore::new()),
            queue: Arc::new(InMemoryTaskQueue::new()),
        }
    }
}

/// Services used by request handlers.
pub struct AppServices {
    pub intake: IntakeService<SharedStore, SharedQueue>,
}

impl AppServices {
    pub fn new(backends: &Backends) -> Self {
        Self {
            intake: IntakeService::new(backends.store.clone(), backends.queue.clone()),
        }
    }
}

pub async fn connect_backends(config: &ApiConfig) -> anyhow::Result<Backends> {
    let store: SharedStore = match &config.database_url {
        Some(url) => {
            let store = PostgresTaskStore::connect(url, config.database_max_connections)
                .await
                .context("connecting to Postgres")?;
            store.migrate().await.context("applying schema")?;
            info!("using Postgres task store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; tasks are kept in memory only");
            Arc::new(InMemoryTaskStore::new())
        }
    };

    Ok(Backends {
        store,
        queue: connect_queue(config).await?,
    })
}

#[cfg(feature = "redis")]
async fn connect_queue(config: &ApiConfig) -> anyhow::Result<SharedQueue> {
    match &config.redis_url {
        Some(url) => {
            let queue = taskforge_infra::queue::RedisStreamsTaskQueue::new(url, None, None)
                .context("opening Redis client")?;
            queue.ensure_group().await.context("creating Redis consumer group")?;
            info!("using Redis Streams task queue");
            Ok(Arc::new(queue))
        }
        None => Ok(Arc::new(InMemoryTaskQueue::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_queue(config: &ApiConfig) -> anyhow::Result<SharedQueue> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL set but redis feature not enabled, falling back to in-memory queue");
    }
    Ok(Arc::new(InMemoryTaskQueue::new()))
}

/// Running background machinery.
pub struct Background {
    pool: WorkerPool,
    shutdown: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

impl Background {
    /// Stop the reaper and relay, then drain the workers.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.loops {
            let _ = handle.await;
        }
        self.pool.shutdown().await;
    }
}

pub fn start_background(config: &EngineConfig, backends: &Backends, registry: Arc<ExecutorRegistry>) -> Background {
    let shutdown = CancellationToken::new();

    let pool = WorkerPool::spawn(
        config,
        backends.store.clone(),
        backends.queue.clone(),
        registry,
    );

    let reaper = LeaseReaper::new(backends.store.clone(), backends.queue.clone())
        .with_backoff(config.backoff.clone())
        .with_interval(config.reaper_interval)
        .with_batch(config.reaper_batch);
    let relay = OutboxRelay::new(backends.store.clone(), backends.queue.clone())
        .with_interval(config.relay_interval)
        .with_grace(config.relay_grace)
        .with_batch(config.relay_batch);

    let reaper_token = shutdown.clone();
    let relay_token = shutdown.clone();
    let loops = vec![
        tokio::spawn(async move { reaper.run(reaper_token).await }),
        tokio::spawn(async move { relay.run(relay_token).await }),
    ];

    Background { pool, shutdown, loops }
}
