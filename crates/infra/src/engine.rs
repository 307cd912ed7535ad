//! Claim-and-execute engine.
//!
//! Turns one `TaskQueued` notification into at most one execution:
//!
//! ```text
//! claim (conditional write) ──▶ re-read ──▶ insert attempt ──▶ resolve executor
//!        │ 0 rows                 │ gone        │ duplicate        │ unknown domain
//!        ▼                        ▼             ▼                  ▼
//!     NotClaimed               Vanished   DuplicateAttempt   ConfigurationError
//!
//! execute ──▶ fold result into (task, attempt, artifact, outbox) ──▶ fenced reconcile
//!                                                                      │ fence lost
//!                                                                      ▼
//!                                                          finalize attempt only
//! ```
//!
//! Duplicate and stale deliveries are harmless: the claim only succeeds for a
//! Queued, due task, and the `(task_id, attempt_no)` uniqueness stops a second
//! execution of the same claim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use taskforge_ai::{ConfigurationError, ExecutionError, ExecutionOutput, ExecutorRegistry, TaskExecutor};
use taskforge_core::attempt::{AI_EXEC_ERROR, AI_TRANSIENT_ERROR};
use taskforge_core::{
    BackoffPolicy, DomainError, RetryDecision, Task, TaskArtifact, TaskAttempt,
};
use taskforge_events::{OutboxError, OutboxMessage, TaskQueue, TaskQueued};

use crate::outbox::dispatch_entry;
use crate::store::{ReconcileOutcome, Reconciliation, StoreError, TaskStore};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No executor for the task's domain. The task is left Running for the
    /// lease reaper.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("illegal task transition: {0}")]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// What handling one notification did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Stale notification: the task was not claimable.
    NotClaimed,
    /// Claimed, but the task could no longer be read.
    Vanished,
    /// This attempt number was already recorded; not executed again.
    DuplicateAttempt,
    Succeeded,
    /// Failed with budget left; claimable again from `available_at`.
    Retrying {
        attempt: u32,
        available_at: DateTime<Utc>,
    },
    DeadLettered,
    /// Executed, but the task was cancelled or re-leased before the result
    /// could be written. Only the attempt was finalized.
    Superseded,
}

pub struct ClaimExecuteEngine<S, Q> {
    store: S,
    queue: Q,
    registry: Arc<ExecutorRegistry>,
    worker: String,
    lease: Duration,
    execution_timeout: Option<Duration>,
    backoff: BackoffPolicy,
}

impl<S, Q> ClaimExecuteEngine<S, Q>
where
    S: TaskStore,
    Q: TaskQueue,
{
    pub fn new(store: S, queue: Q, registry: Arc<ExecutorRegistry>, worker: impl Into<String>) -> Self {
        Self {
            store,
            queue,
            registry,
            worker: worker.into(),
            lease: Duration::from_secs(600),
            execution_timeout: None,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Handle one notification end to end.
    #[instrument(
        skip(self, message, cancel),
        fields(
            task_id = %message.task_id,
            attempt = message.attempt,
            correlation_id = %message.correlation_id,
            worker = %self.worker
        )
    )]
    pub async fn handle(
        &self,
        message: &TaskQueued,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, EngineError> {
        let claimed_at = Utc::now();
        if !self
            .store
            .claim(message.task_id, &self.worker, claimed_at, self.lease)
            .await?
        {
            debug!("task not claimable; dropping stale notification");
            return Ok(ProcessOutcome::NotClaimed);
        }

        let Some(task) = self.store.get(message.task_id).await? else {
            warn!("claimed task disappeared before it could be read");
            return Ok(ProcessOutcome::Vanished);
        };
        let Some(fence) = task.lease_fence().filter(|f| f.locked_by == self.worker) else {
            info!(status = %task.status(), "task changed hands right after claim");
            return Ok(ProcessOutcome::Superseded);
        };

        let mut attempt = TaskAttempt::start(task.id(), task.attempt_count(), claimed_at);
        if !self.store.insert_attempt(&attempt).await? {
            warn!(attempt_no = attempt.attempt_no(), "attempt already recorded; not executing again");
            return Ok(ProcessOutcome::DuplicateAttempt);
        }

        let executor = self.registry.resolve(task.domain()).inspect_err(|e| {
            error!(domain = %task.domain(), error = %e, "no executor for task domain");
        })?;
        attempt.set_executor(executor.name());

        let started = Instant::now();
        let result = self.execute(executor.as_ref(), &task, cancel).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let finished_at = Utc::now();

        let mut next = task.clone();
        let (artifact, outbox, outcome) = match result {
            Ok(ExecutionOutput { content, metrics }) => {
                attempt.complete_success(executor.name(), metrics, latency_ms, finished_at)?;
                next.mark_succeeded(finished_at)?;
                let artifact = TaskArtifact::text(task.id(), content, finished_at);
                (Some(artifact), None, ProcessOutcome::Succeeded)
            }
            Err(err) => {
                let code = if err.is_transient() {
                    AI_TRANSIENT_ERROR
                } else {
                    AI_EXEC_ERROR
                };
                warn!(error_code = code, error = %err, latency_ms, "attempt failed");
                attempt.complete_failure(code, err.to_string(), Some(latency_ms), finished_at)?;

                match next.mark_attempt_failed(err.to_string(), finished_at, &self.backoff)? {
                    RetryDecision::Retry { attempt: n, available_at } => {
                        let retry = message.retry(n);
                        let entry = OutboxMessage::task_queued(&retry, finished_at, available_at)?;
                        (None, Some(entry), ProcessOutcome::Retrying { attempt: n, available_at })
                    }
                    RetryDecision::DeadLetter => (None, None, ProcessOutcome::DeadLettered),
                }
            }
        };

        let unit = Reconciliation {
            fence,
            task: next,
            attempt: attempt.clone(),
            artifact,
            outbox: outbox.clone(),
        };
        match self.store.reconcile(unit).await? {
            ReconcileOutcome::Applied => {
                info!(outcome = ?outcome, latency_ms, "attempt reconciled");
                if let Some(entry) = outbox.filter(|e| e.is_due(finished_at)) {
                    dispatch_entry(&self.store, &self.queue, &entry, finished_at).await;
                }
                Ok(outcome)
            }
            ReconcileOutcome::Superseded => {
                self.store.finalize_attempt(&attempt).await?;
                info!("task was cancelled or re-leased during execution; result not applied");
                Ok(ProcessOutcome::Superseded)
            }
        }
    }

    async fn execute(
        &self,
        executor: &dyn TaskExecutor,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let token = cancel.child_token();
        let run = executor.execute(task.capability(), task.payload(), token.clone());
        match self.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    token.cancel();
                    Err(ExecutionError::transient(format!(
                        "execution timed out after {} ms",
                        limit.as_millis()
                    )))
                }
            },
            None => run.await,
        }
    }
}
