//! Integration tests for the full task pipeline.
//!
//! Tests: Intake → Outbox → Queue → WorkerPool → Engine → Store
//!
//! Verifies:
//! - Retry budget and dead-lettering across real worker round trips
//! - Duplicate notifications never execute a task twice
//! - A cancel during execution is not overwritten by the late result
//! - Stuck tasks are recovered by the reaper
//! - A worker that outlives its lease cannot overwrite the reaper's recovery

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use taskforge_ai::{
        ExecutionError, ExecutionOutput, ExecutorRegistry, SimulatedExecutor, TaskExecutor,
    };
    use taskforge_core::attempt::{AI_TRANSIENT_ERROR, LEASE_EXPIRED};
    use taskforge_core::{
        AttemptStatus, BackoffPolicy, CapabilityType, DomainType, ExecutionMetrics, ExecutionType,
        NewTask, Task, TaskId, TaskStatus, TenantId,
    };
    use taskforge_events::{InMemoryTaskQueue, TaskQueue, TaskQueued};

    use crate::config::EngineConfig;
    use crate::engine::{ClaimExecuteEngine, ProcessOutcome};
    use crate::intake::IntakeService;
    use crate::reaper::LeaseReaper;
    use crate::store::{InMemoryTaskStore, TaskStore};
    use crate::worker::WorkerPool;

    /// Fails transiently `failures` times, then succeeds.
    struct FlakyExecutor {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyExecutor {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl TaskExecutor for FlakyExecutor {
        fn domain(&self) -> DomainType {
            DomainType::DataAnalysis
        }

        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(
            &self,
            _capability: CapabilityType,
            _payload: &str,
            _cancel: CancellationToken,
        ) -> Result<ExecutionOutput, ExecutionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(ExecutionError::transient(format!("provider hiccup #{call}")));
            }
            Ok(ExecutionOutput::new("report ready")
                .with_metrics(ExecutionMetrics::default().with_model("flaky-1").with_tokens(12, 34)))
        }
    }

    struct Harness {
        store: Arc<InMemoryTaskStore>,
        queue: Arc<InMemoryTaskQueue>,
        intake: IntakeService<Arc<InMemoryTaskStore>, Arc<InMemoryTaskQueue>>,
        pool: WorkerPool,
    }

    fn config(workers: usize) -> EngineConfig {
        EngineConfig {
            worker_id: "it".into(),
            workers,
            lease: Duration::from_secs(60),
            backoff: BackoffPolicy::immediate(),
            poll_interval: Duration::from_millis(20),
            ..EngineConfig::default()
        }
    }

    fn start(registry: ExecutorRegistry, workers: usize) -> Harness {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let intake = IntakeService::new(store.clone(), queue.clone());
        let pool = WorkerPool::spawn(
            &config(workers),
            store.clone(),
            queue.clone(),
            Arc::new(registry),
        );
        Harness {
            store,
            queue,
            intake,
            pool,
        }
    }

    fn new_task(domain: DomainType, payload: &str, key: &str, max_attempts: u32) -> NewTask {
        NewTask {
            tenant_id: TenantId::parse("acme").unwrap(),
            domain,
            capability: CapabilityType::LlmReasoning,
            execution: ExecutionType::Async,
            priority: 0,
            payload: payload.into(),
            idempotency_key: key.into(),
            scheduled_at: None,
            max_attempts,
        }
    }

    async fn wait_for<F>(store: &InMemoryTaskStore, id: TaskId, done: F) -> Task
    where
        F: Fn(&Task) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = store.get(id).await.unwrap().unwrap();
            if done(&task) {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting on task {id}; last status {}",
                task.status()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn three_transient_failures_dead_letter_with_three_attempts() {
        let h = start(ExecutorRegistry::simulated(Duration::ZERO), 2);
        let task = h
            .intake
            .create(new_task(
                DomainType::CustomerSupport,
                r#"{"forceTransientFail":true}"#,
                "always-fails",
                3,
            ))
            .await
            .unwrap()
            .task;

        let done = wait_for(&h.store, task.id(), |t| t.status() == TaskStatus::DeadLetter).await;
        assert_eq!(done.attempt_count(), 3);
        assert!(done.locked_by().is_none());

        let attempts = h.store.list_attempts(task.id()).await.unwrap();
        let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_no()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(attempts
            .iter()
            .all(|a| a.status() == AttemptStatus::Failed && a.error_code() == Some(AI_TRANSIENT_ERROR)));
        assert!(h.store.list_artifacts(task.id()).await.unwrap().is_empty());

        h.pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn success_after_transient_failures() {
        let flaky: Arc<dyn TaskExecutor> = Arc::new(FlakyExecutor::new(2));
        let h = start(ExecutorRegistry::new(vec![flaky]).unwrap(), 2);
        let task = h
            .intake
            .create(new_task(DomainType::DataAnalysis, r#"{"q":1}"#, "flaky", 5))
            .await
            .unwrap()
            .task;

        let done = wait_for(&h.store, task.id(), |t| t.status() == TaskStatus::Succeeded).await;
        assert_eq!(done.attempt_count(), 3);

        let attempts = h.store.list_attempts(task.id()).await.unwrap();
        let statuses: Vec<AttemptStatus> = attempts.iter().map(|a| a.status()).collect();
        assert_eq!(
            statuses,
            vec![AttemptStatus::Failed, AttemptStatus::Failed, AttemptStatus::Succeeded]
        );
        assert_eq!(attempts[2].metrics().tokens_out, Some(34));

        let artifacts = h.store.list_artifacts(task.id()).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].content(), Some("report ready"));

        h.pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn duplicate_notifications_execute_once() {
        let h = start(ExecutorRegistry::simulated(Duration::from_millis(50)), 4);
        let task = h
            .intake
            .create(new_task(DomainType::DocumentProcessing, "{}", "dup", 3))
            .await
            .unwrap()
            .task;

        let again = TaskQueued::initial(task.id(), task.tenant_id().clone(), task.capability());
        for _ in 0..3 {
            h.queue.publish(again.clone()).await.unwrap();
        }

        wait_for(&h.store, task.id(), |t| t.status() == TaskStatus::Succeeded).await;
        // Let the stale copies drain.
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(h.store.list_attempts(task.id()).await.unwrap().len(), 1);
        assert_eq!(h.store.list_artifacts(task.id()).await.unwrap().len(), 1);

        h.pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_during_execution_is_not_overwritten() {
        let h = start(ExecutorRegistry::simulated(Duration::from_millis(300)), 1);
        let task = h
            .intake
            .create(new_task(DomainType::ContentCreation, "{}", "slow", 3))
            .await
            .unwrap()
            .task;

        wait_for(&h.store, task.id(), |t| t.status() == TaskStatus::Running).await;
        let cancelled = h.intake.cancel(task.id()).await.unwrap().unwrap();
        assert_eq!(cancelled.status(), TaskStatus::Cancelled);

        // The executor finishes; its attempt is closed but the task stays put.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let attempts = h.store.list_attempts(task.id()).await.unwrap();
            if attempts.first().is_some_and(|a| a.is_finalized()) {
                assert_eq!(attempts[0].status(), AttemptStatus::Succeeded);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "attempt never finalized");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stored = h.store.get(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::Cancelled);
        assert!(h.store.list_artifacts(task.id()).await.unwrap().is_empty());

        h.pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unregistered_domain_is_recovered_by_the_reaper() {
        let only: Arc<dyn TaskExecutor> = Arc::new(SimulatedExecutor::new(DomainType::ComplianceCheck));
        let h = start(ExecutorRegistry::new(vec![only]).unwrap(), 1);
        let task = h
            .intake
            .create(new_task(DomainType::CodeAutomation, "{}", "orphan", 1))
            .await
            .unwrap()
            .task;

        let stuck = wait_for(&h.store, task.id(), |t| t.status() == TaskStatus::Running).await;
        h.pool.shutdown().await;

        let reaper = LeaseReaper::new(h.store.clone(), h.queue.clone());
        let after_lease = stuck.locked_until().unwrap() + chrono::Duration::seconds(1);
        let report = reaper.sweep_at(after_lease).await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        let stored = h.store.get(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::DeadLetter);
        let attempts = h.store.list_attempts(task.id()).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].error_code(), Some(LEASE_EXPIRED));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_result_after_reaped_lease_is_superseded() {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let intake = IntakeService::new(store.clone(), queue.clone());
        let slow: Arc<dyn TaskExecutor> = Arc::new(
            SimulatedExecutor::new(DomainType::DecisionAutomation).with_latency(Duration::from_millis(400)),
        );
        let engine = ClaimExecuteEngine::new(
            store.clone(),
            queue.clone(),
            Arc::new(ExecutorRegistry::new(vec![slow]).unwrap()),
            "slow-worker",
        )
        .with_lease(Duration::from_millis(50))
        .with_backoff(BackoffPolicy::immediate());

        let task = intake
            .create(new_task(DomainType::DecisionAutomation, "{}", "outlived", 3))
            .await
            .unwrap()
            .task;
        let message = TaskQueued::initial(task.id(), task.tenant_id().clone(), task.capability());
        let running = tokio::spawn(async move { engine.handle(&message, &CancellationToken::new()).await });

        // The attempt row must exist before the sweep, otherwise the worker
        // would see a duplicate instead of a lost lease.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.list_attempts(task.id()).await.unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "attempt never recorded");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stuck = store.get(task.id()).await.unwrap().unwrap();
        assert_eq!(stuck.status(), TaskStatus::Running);

        let reaper = LeaseReaper::new(store.clone(), queue.clone()).with_backoff(BackoffPolicy::immediate());
        let after_lease = stuck.locked_until().unwrap() + chrono::Duration::seconds(1);
        let report = reaper.sweep_at(after_lease).await.unwrap();
        assert_eq!(report.requeued, 1);

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome, ProcessOutcome::Superseded);

        let stored = store.get(task.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::Queued);
        assert_eq!(stored.attempt_count(), 1);
        assert!(stored.locked_by().is_none());
        assert_eq!(stored.last_error(), Some("lease expired"));

        let attempts = store.list_attempts(task.id()).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status(), AttemptStatus::Failed);
        assert_eq!(attempts[0].error_code(), Some(LEASE_EXPIRED));
        assert!(store.list_artifacts(task.id()).await.unwrap().is_empty());
    }
}
