//! Background worker pool.
//!
//! Each worker is a tokio task that receives `TaskQueued` notifications and
//! hands them to its own [`ClaimExecuteEngine`]. Workers compete on one queue;
//! the claim decides who runs a task.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskforge_ai::ExecutorRegistry;
use taskforge_events::{Delivery, QueueError, TaskQueue};

use crate::config::EngineConfig;
use crate::engine::{ClaimExecuteEngine, EngineError};
use crate::store::TaskStore;

/// Handle to stop and join the pool.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers onto the current runtime.
    pub fn spawn<S, Q>(
        config: &EngineConfig,
        store: S,
        queue: Q,
        registry: Arc<ExecutorRegistry>,
    ) -> Self
    where
        S: TaskStore + Clone + 'static,
        Q: TaskQueue + Clone + 'static,
    {
        let shutdown = CancellationToken::new();
        let handles = (0..config.workers)
            .map(|index| {
                let engine = ClaimExecuteEngine::new(
                    store.clone(),
                    queue.clone(),
                    registry.clone(),
                    config.worker_name(index),
                )
                .with_lease(config.lease)
                .with_execution_timeout(config.execution_timeout)
                .with_backoff(config.backoff.clone());

                tokio::spawn(worker_loop(
                    engine,
                    queue.clone(),
                    config.poll_interval,
                    shutdown.clone(),
                ))
            })
            .collect();

        info!(workers = config.workers, worker_id = %config.worker_id, "worker pool started");
        Self { shutdown, handles }
    }

    /// Request graceful shutdown and wait for every worker to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop<S, Q>(
    engine: ClaimExecuteEngine<S, Q>,
    queue: Q,
    poll: Duration,
    shutdown: CancellationToken,
) where
    S: TaskStore,
    Q: TaskQueue,
{
    let name = engine.worker().to_string();
    debug!(worker = %name, "worker started");

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = queue.receive(&name, poll) => received,
        };

        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(QueueError::Closed) => break,
            Err(e) => {
                warn!(worker = %name, error = %e, "receive failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll) => continue,
                }
            }
        };

        let cancel = shutdown.child_token();
        let ack = match engine.handle(&delivery.message, &cancel).await {
            Ok(outcome) => {
                debug!(worker = %name, task_id = %delivery.message.task_id, outcome = ?outcome, "notification handled");
                true
            }
            // Left Running on purpose; the reaper owns recovery.
            Err(EngineError::Configuration(_)) => true,
            Err(EngineError::Store(e)) => {
                warn!(worker = %name, task_id = %delivery.message.task_id, error = %e, "store failure; notification left unacknowledged");
                false
            }
            Err(e) => {
                error!(worker = %name, task_id = %delivery.message.task_id, error = %e, "notification handling failed");
                true
            }
        };

        if ack {
            acknowledge(&queue, &delivery, &name).await;
        }
    }

    debug!(worker = %name, "worker stopped");
}

async fn acknowledge<Q: TaskQueue>(queue: &Q, delivery: &Delivery, worker: &str) {
    if let Err(e) = queue.ack(delivery).await {
        warn!(worker, error = %e, "ack failed");
    }
}
