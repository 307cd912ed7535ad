use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use taskforge_core::{CancelOutcome, Task, TaskArtifact, TaskAttempt, TaskId, TenantId};
use taskforge_events::OutboxMessage;

use super::r#trait::{
    InsertOutcome, ListQuery, Page, ReconcileOutcome, Reconciliation, StoreError, TaskStore,
};

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    by_key: HashMap<(TenantId, String), TaskId>,
    attempts: HashMap<TaskId, Vec<TaskAttempt>>,
    artifacts: HashMap<TaskId, Vec<TaskArtifact>>,
    outbox: Vec<OutboxMessage>,
}

impl State {
    /// Insert-or-update-while-running, mirroring the SQL upsert.
    fn upsert_attempt(&mut self, attempt: &TaskAttempt) -> bool {
        let attempts = self.attempts.entry(attempt.task_id()).or_default();
        match attempts
            .iter_mut()
            .find(|a| a.attempt_no() == attempt.attempt_no())
        {
            Some(existing) if !existing.is_finalized() => {
                // Keep the original identity, like an ON CONFLICT update would.
                *existing = rebind_attempt(attempt, existing);
                true
            }
            Some(_) => false,
            None => {
                attempts.push(attempt.clone());
                attempts.sort_by_key(TaskAttempt::attempt_no);
                true
            }
        }
    }
}

fn rebind_attempt(attempt: &TaskAttempt, existing: &TaskAttempt) -> TaskAttempt {
    TaskAttempt::from_parts(taskforge_core::AttemptParts {
        id: existing.id(),
        task_id: attempt.task_id(),
        attempt_no: attempt.attempt_no(),
        started_at: existing.started_at(),
        ended_at: attempt.ended_at(),
        status: attempt.status(),
        executor: attempt.executor().map(str::to_string),
        metrics: attempt.metrics().clone(),
        latency_ms: attempt.latency_ms(),
        error_code: attempt.error_code().map(str::to_string),
        error_detail: attempt.error_detail().map(str::to_string),
    })
}

/// In-memory task store.
///
/// Intended for tests/dev. One lock guards all tables, so every operation is
/// trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    state: RwLock<State>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All outbox entries, in insertion order.
    pub fn outbox_entries(&self) -> Vec<OutboxMessage> {
        self.state
            .read()
            .map(|s| s.outbox.clone())
            .unwrap_or_default()
    }

    /// Overwrite a stored task. Test hook for staging states such as an
    /// expired lease.
    pub fn put_task(&self, task: Task) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state
            .by_key
            .insert((task.tenant_id().clone(), task.idempotency_key().to_string()), task.id());
        state.tasks.insert(task.id(), task);
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: Task, outbox: OutboxMessage) -> Result<InsertOutcome, StoreError> {
        let mut state = self.write()?;
        let key = (task.tenant_id().clone(), task.idempotency_key().to_string());
        if let Some(existing) = state.by_key.get(&key).and_then(|id| state.tasks.get(id)) {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }
        if state.tasks.contains_key(&task.id()) {
            return Err(StoreError::Conflict(format!("task {} already exists", task.id())));
        }

        state.by_key.insert(key, task.id());
        state.tasks.insert(task.id(), task.clone());
        state.outbox.push(outbox);
        Ok(InsertOutcome::Inserted(task))
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.read()?.tasks.get(&id).cloned())
    }

    async fn find_by_idempotency(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Task>, StoreError> {
        let state = self.read()?;
        let key = (tenant_id.clone(), idempotency_key.to_string());
        Ok(state.by_key.get(&key).and_then(|id| state.tasks.get(id)).cloned())
    }

    async fn list(&self, query: &ListQuery) -> Result<Page<Task>, StoreError> {
        let state = self.read()?;
        let mut matching: Vec<&Task> = state.tasks.values().filter(|t| query.matches(t)).collect();
        matching.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(&a.id()))
        });

        let total_count = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
            .take(query.page_size as usize)
            .cloned()
            .collect();
        Ok(Page { items, total_count })
    }

    async fn claim(
        &self,
        id: TaskId,
        worker: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if !task.can_be_claimed(now) {
            return Ok(false);
        }
        task.claim(worker, now, lease)
            .map_err(|e| StoreError::Storage(format!("claim rejected: {e}")))?;
        Ok(true)
    }

    async fn insert_attempt(&self, attempt: &TaskAttempt) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let attempts = state.attempts.entry(attempt.task_id()).or_default();
        if attempts.iter().any(|a| a.attempt_no() == attempt.attempt_no()) {
            return Ok(false);
        }
        attempts.push(attempt.clone());
        attempts.sort_by_key(TaskAttempt::attempt_no);
        Ok(true)
    }

    async fn reconcile(&self, unit: Reconciliation) -> Result<ReconcileOutcome, StoreError> {
        let mut state = self.write()?;
        let holds = state
            .tasks
            .get(&unit.task.id())
            .is_some_and(|stored| stored.holds_lease(&unit.fence));
        if !holds {
            return Ok(ReconcileOutcome::Superseded);
        }

        let task_id = unit.task.id();
        state.tasks.insert(task_id, unit.task);
        state.upsert_attempt(&unit.attempt);
        if let Some(artifact) = unit.artifact {
            state.artifacts.entry(task_id).or_default().push(artifact);
        }
        if let Some(outbox) = unit.outbox {
            state.outbox.push(outbox);
        }
        Ok(ReconcileOutcome::Applied)
    }

    async fn finalize_attempt(&self, attempt: &TaskAttempt) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        Ok(state.upsert_attempt(attempt))
    }

    async fn cancel(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<(Task, CancelOutcome)>, StoreError> {
        let mut state = self.write()?;
        Ok(state.tasks.get_mut(&id).map(|task| {
            let outcome = task.try_cancel(now);
            (task.clone(), outcome)
        }))
    }

    async fn list_attempts(&self, id: TaskId) -> Result<Vec<TaskAttempt>, StoreError> {
        Ok(self.read()?.attempts.get(&id).cloned().unwrap_or_default())
    }

    async fn list_artifacts(&self, id: TaskId) -> Result<Vec<TaskArtifact>, StoreError> {
        let mut artifacts = self.read()?.artifacts.get(&id).cloned().unwrap_or_default();
        artifacts.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(&a.id()))
        });
        Ok(artifacts)
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Task>, StoreError> {
        let state = self.read()?;
        let mut expired: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.is_lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(Task::locked_until);
        expired.truncate(limit as usize);
        Ok(expired)
    }

    async fn pending_outbox(
        &self,
        due_at: DateTime<Utc>,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let state = self.read()?;
        let mut pending: Vec<OutboxMessage> = state
            .outbox
            .iter()
            .filter(|m| !m.is_processed() && m.is_due(due_at) && m.created_at() <= created_before)
            .cloned()
            .collect();
        pending.sort_by_key(OutboxMessage::available_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn mark_outbox_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if let Some(entry) = state.outbox.iter_mut().find(|m| m.id() == id) {
            entry.mark_processed(now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use taskforge_core::{
        AttemptStatus, BackoffPolicy, CapabilityType, DomainType, ExecutionType, NewTask, TaskStatus,
        attempt::AI_TRANSIENT_ERROR,
    };
    use taskforge_events::TaskQueued;

    use super::*;

    const LEASE: Duration = Duration::from_secs(600);

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).unwrap()
    }

    fn task(tenant_id: &str, key: &str, now: DateTime<Utc>) -> (Task, OutboxMessage) {
        let task = Task::new(
            NewTask {
                tenant_id: tenant(tenant_id),
                domain: DomainType::ComplianceCheck,
                capability: CapabilityType::RuleEngine,
                execution: ExecutionType::Batch,
                priority: 1,
                payload: "{}".into(),
                idempotency_key: key.into(),
                scheduled_at: None,
                max_attempts: 3,
            },
            now,
        )
        .unwrap();
        let msg = TaskQueued::initial(task.id(), task.tenant_id().clone(), task.capability());
        let outbox = OutboxMessage::task_queued(&msg, now, now).unwrap();
        (task, outbox)
    }

    #[tokio::test]
    async fn duplicate_key_returns_existing_task() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let (first, outbox) = task("t1", "k", now);
        let (second, outbox2) = task("t1", "k", now);

        assert!(matches!(store.insert(first.clone(), outbox).await.unwrap(), InsertOutcome::Inserted(_)));
        let dup = store.insert(second, outbox2).await.unwrap();
        assert_eq!(dup, InsertOutcome::Duplicate(first));
        assert_eq!(store.outbox_entries().len(), 1);

        // Same key, different tenant: independent.
        let (other, outbox3) = task("t2", "k", now);
        assert!(matches!(store.insert(other, outbox3).await.unwrap(), InsertOutcome::Inserted(_)));
    }

    #[tokio::test]
    async fn only_one_concurrent_claim_wins() {
        let store = Arc::new(InMemoryTaskStore::new());
        let now = Utc::now();
        let (t, outbox) = task("t1", "k", now);
        let id = t.id();
        store.insert(t, outbox).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim(id, &format!("w{i}"), now, LEASE).await.unwrap()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().attempt_count(), 1);
    }

    #[tokio::test]
    async fn reconcile_refuses_cancelled_task_but_attempt_can_be_finalized() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let (t, outbox) = task("t1", "k", now);
        let id = t.id();
        store.insert(t, outbox).await.unwrap();
        assert!(store.claim(id, "w", now, LEASE).await.unwrap());

        let claimed = store.get(id).await.unwrap().unwrap();
        let fence = claimed.lease_fence().unwrap();
        let mut attempt = TaskAttempt::start(id, 1, now);
        assert!(store.insert_attempt(&attempt).await.unwrap());
        assert!(!store.insert_attempt(&TaskAttempt::start(id, 1, now)).await.unwrap());

        let (_, outcome) = store.cancel(id, now).await.unwrap().unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled);

        let mut next = claimed.clone();
        next.mark_attempt_failed("boom", now, &BackoffPolicy::immediate()).unwrap();
        attempt.complete_failure(AI_TRANSIENT_ERROR, "boom", Some(1), now).unwrap();
        let outcome = store
            .reconcile(Reconciliation {
                fence,
                task: next,
                attempt: attempt.clone(),
                artifact: None,
                outbox: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Superseded);
        assert_eq!(store.get(id).await.unwrap().unwrap().status(), TaskStatus::Cancelled);

        assert!(store.finalize_attempt(&attempt).await.unwrap());
        assert!(!store.finalize_attempt(&attempt).await.unwrap());
        let attempts = store.list_attempts(id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status(), AttemptStatus::Failed);
    }

    #[tokio::test]
    async fn list_filters_and_pages_newest_first() {
        let store = InMemoryTaskStore::new();
        let base = Utc::now();
        for i in 0..5 {
            let (t, o) = task("t1", &format!("k{i}"), base + chrono::Duration::seconds(i));
            store.insert(t, o).await.unwrap();
        }
        let (t, o) = task("t2", "other", base);
        store.insert(t, o).await.unwrap();

        let page = store
            .list(&ListQuery {
                tenant_id: Some(tenant("t1")),
                page: 1,
                page_size: 2,
                ..ListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total_count, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].idempotency_key(), "k4");
        assert_eq!(page.items[1].idempotency_key(), "k3");

        let last = store
            .list(&ListQuery {
                tenant_id: Some(tenant("t1")),
                page: 3,
                page_size: 2,
                ..ListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].idempotency_key(), "k0");
    }

    #[tokio::test]
    async fn pending_outbox_respects_due_and_grace() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let (t, o) = task("t1", "k", now);
        let entry_id = o.id();
        store.insert(t, o).await.unwrap();

        let early = store
            .pending_outbox(now, now - chrono::Duration::seconds(1), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        let due = store.pending_outbox(now, now, 10).await.unwrap();
        assert_eq!(due.len(), 1);

        store.mark_outbox_processed(entry_id, now).await.unwrap();
        assert!(store.pending_outbox(now, now, 10).await.unwrap().is_empty());
    }
}
