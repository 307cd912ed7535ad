//! Lease reaper.
//!
//! Recovers tasks whose worker died mid-execution: the task stays Running with
//! a lease in the past until this sweep re-queues it (budget left) or
//! dead-letters it. The open attempt is closed as `LEASE_EXPIRED`.
//!
//! The recovery write is fenced on the expired lease, so a worker that finishes
//! late and a concurrent reaper cannot both apply.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use taskforge_core::attempt::LEASE_EXPIRED;
use taskforge_core::{BackoffPolicy, RetryDecision, Task, TaskAttempt};
use taskforge_events::{OutboxMessage, TaskQueue, TaskQueued};

use crate::engine::EngineError;
use crate::outbox::dispatch_entry;
use crate::store::{ReconcileOutcome, Reconciliation, TaskStore};

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Expired leases that changed under us before the write.
    pub skipped: usize,
}

pub struct LeaseReaper<S, Q> {
    store: S,
    queue: Q,
    backoff: BackoffPolicy,
    interval: Duration,
    batch: u32,
}

impl<S, Q> LeaseReaper<S, Q>
where
    S: TaskStore,
    Q: TaskQueue,
{
    pub fn new(store: S, queue: Q) -> Self {
        Self {
            store,
            queue,
            backoff: BackoffPolicy::default(),
            interval: Duration::from_secs(30),
            batch: 100,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch(mut self, batch: u32) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Recover every task whose lease expired before `now`.
    #[instrument(skip(self), err)]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        let expired = self.store.expired_leases(now, self.batch).await?;
        let mut report = SweepReport::default();

        for task in expired {
            match self.recover(task, now).await? {
                Some(RetryDecision::Retry { .. }) => report.requeued += 1,
                Some(RetryDecision::DeadLetter) => report.dead_lettered += 1,
                None => report.skipped += 1,
            }
        }

        if report != SweepReport::default() {
            info!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                skipped = report.skipped,
                "lease sweep finished"
            );
        }
        Ok(report)
    }

    async fn recover(&self, task: Task, now: DateTime<Utc>) -> Result<Option<RetryDecision>, EngineError> {
        let Some(fence) = task.lease_fence() else {
            return Ok(None);
        };

        let mut attempt = TaskAttempt::start(task.id(), task.attempt_count(), now);
        attempt.complete_failure(
            LEASE_EXPIRED,
            format!("lease held by {} expired", fence.locked_by),
            None,
            now,
        )?;

        let mut next = task.clone();
        let decision = next.expire_lease(now, &self.backoff)?;
        let outbox = match decision {
            RetryDecision::Retry { attempt: n, available_at } => {
                let message = TaskQueued::initial(task.id(), task.tenant_id().clone(), task.capability()).retry(n);
                Some(OutboxMessage::task_queued(&message, now, available_at)?)
            }
            RetryDecision::DeadLetter => None,
        };

        let unit = Reconciliation {
            fence,
            task: next,
            attempt,
            artifact: None,
            outbox: outbox.clone(),
        };
        match self.store.reconcile(unit).await? {
            ReconcileOutcome::Applied => {
                warn!(task_id = %task.id(), decision = ?decision, "recovered expired lease");
                if let Some(entry) = outbox.filter(|e| e.is_due(now)) {
                    dispatch_entry(&self.store, &self.queue, &entry, now).await;
                }
                Ok(Some(decision))
            }
            ReconcileOutcome::Superseded => {
                debug!(task_id = %task.id(), "expired lease changed before recovery");
                Ok(None)
            }
        }
    }

    /// Sweep on an interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "lease reaper started");
        loop {
            if let Err(e) = self.sweep_at(Utc::now()).await {
                error!(error = %e, "lease sweep failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        debug!("lease reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use taskforge_core::{
        AttemptStatus, CapabilityType, DomainType, ExecutionType, NewTask, TaskStatus, TenantId,
    };
    use taskforge_events::InMemoryTaskQueue;

    use super::*;
    use crate::store::InMemoryTaskStore;

    const LEASE: Duration = Duration::from_secs(60);

    async fn running_task(store: &InMemoryTaskStore, max_attempts: u32, now: DateTime<Utc>) -> Task {
        let task = Task::new(
            NewTask {
                tenant_id: TenantId::parse("acme").unwrap(),
                domain: DomainType::MonitoringAlert,
                capability: CapabilityType::RuleEngine,
                execution: ExecutionType::EventDriven,
                priority: 0,
                payload: "{}".into(),
                idempotency_key: format!("reap-{max_attempts}"),
                scheduled_at: None,
                max_attempts,
            },
            now,
        )
        .unwrap();
        let msg = TaskQueued::initial(task.id(), task.tenant_id().clone(), task.capability());
        store
            .insert(task.clone(), OutboxMessage::task_queued(&msg, now, now).unwrap())
            .await
            .unwrap();
        assert!(store.claim(task.id(), "dead-worker", now, LEASE).await.unwrap());
        store
            .insert_attempt(&TaskAttempt::start(task.id(), 1, now))
            .await
            .unwrap();
        task
    }

    #[tokio::test]
    async fn expired_lease_is_requeued_and_attempt_closed() {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let start = Utc::now();
        let task = running_task(&store, 3, start).await;

        let reaper = LeaseReaper::new(store.clone(), queue.clone()).with_backoff(BackoffPolicy::immediate());

        // Lease still valid.
        assert_eq!(reaper.sweep_at(start).await.unwrap(), SweepReport::default());

        let later = start + chrono::Duration::seconds(61);
        let report = reaper.sweep_at(later).await.unwrap();
        assert_eq!(report.requeued, 1);

        let stored = store.get(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::Queued);
        assert!(stored.locked_by().is_none());
        assert_eq!(stored.last_error(), Some("lease expired"));

        let attempts = store.list_attempts(task.id()).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status(), AttemptStatus::Failed);
        assert_eq!(attempts[0].error_code(), Some(LEASE_EXPIRED));
        assert_eq!(attempts[0].started_at(), start);

        assert_eq!(queue.published().len(), 1);
        assert_eq!(queue.published()[0].attempt, 1);
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters() {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let start = Utc::now();
        let task = running_task(&store, 1, start).await;

        let reaper = LeaseReaper::new(store.clone(), queue.clone());
        let report = reaper.sweep_at(start + chrono::Duration::minutes(5)).await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        let stored = store.get(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::DeadLetter);
        assert!(queue.published().is_empty());
    }
}
