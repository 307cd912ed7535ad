use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use taskforge_core::{
    CancelOutcome, CapabilityType, DomainType, ExecutionType, LeaseFence, Task, TaskArtifact,
    TaskAttempt, TaskId, TaskStatus, TenantId,
};
use taskforge_events::OutboxMessage;

/// Task store operation error.
///
/// These are **infrastructure errors**. Business outcomes (stale claim,
/// duplicate attempt, refused reconciliation) are reported through return
/// values, not errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness rule was violated in a way the operation could not resolve.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored row could not be mapped back into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of inserting a task.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Task),
    /// A task with the same `(tenant, idempotency_key)` already exists; it is
    /// returned unchanged and nothing was written.
    Duplicate(Task),
}

impl InsertOutcome {
    pub fn task(&self) -> &Task {
        match self {
            InsertOutcome::Inserted(task) | InsertOutcome::Duplicate(task) => task,
        }
    }

    pub fn into_task(self) -> Task {
        match self {
            InsertOutcome::Inserted(task) | InsertOutcome::Duplicate(task) => task,
        }
    }
}

/// Filters and paging for [`TaskStore::list`]. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub status: Option<TaskStatus>,
    pub domain: Option<DomainType>,
    pub capability: Option<CapabilityType>,
    pub execution: Option<ExecutionType>,
    pub tenant_id: Option<TenantId>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            domain: None,
            capability: None,
            execution: None,
            tenant_id: None,
            page: 1,
            page_size: 20,
        }
    }
}

impl ListQuery {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status() == s)
            && self.domain.is_none_or(|d| task.domain() == d)
            && self.capability.is_none_or(|c| task.capability() == c)
            && self.execution.is_none_or(|e| task.execution() == e)
            && self.tenant_id.as_ref().is_none_or(|t| task.tenant_id() == t)
    }
}

/// One page of results plus the size of the whole filtered set.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
}

/// Everything produced by the end of one attempt, written as a unit.
///
/// `task` is the post-transition task state. The write only happens if the
/// stored task still holds `fence`.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub fence: LeaseFence,
    pub task: Task,
    pub attempt: TaskAttempt,
    pub artifact: Option<TaskArtifact>,
    pub outbox: Option<OutboxMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    /// The task was cancelled, reaped or re-claimed meanwhile. Nothing was
    /// written.
    Superseded,
}

/// Durable task storage.
///
/// ## Atomicity requirements
///
/// - `insert` commits the task and its outbox entry together, and resolves
///   `(tenant_id, idempotency_key)` collisions to the existing task.
/// - `claim` is one conditional write: Queued, lease unset/expired, due, and
///   budget left. Exactly one concurrent caller can win.
/// - `insert_attempt` is unique per `(task_id, attempt_no)`.
/// - `reconcile` is check-then-write against the lease fence, all or nothing.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: Task, outbox: OutboxMessage) -> Result<InsertOutcome, StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    async fn find_by_idempotency(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Task>, StoreError>;

    /// Newest first.
    async fn list(&self, query: &ListQuery) -> Result<Page<Task>, StoreError>;

    /// `true` if this caller now holds the lease.
    async fn claim(
        &self,
        id: TaskId,
        worker: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// `false` if an attempt with the same number already exists.
    async fn insert_attempt(&self, attempt: &TaskAttempt) -> Result<bool, StoreError>;

    async fn reconcile(&self, unit: Reconciliation) -> Result<ReconcileOutcome, StoreError>;

    /// Store a finalized attempt without touching the task.
    ///
    /// Inserts the attempt if it was never recorded; otherwise updates it only
    /// while it is still Running. Returns whether anything was written.
    async fn finalize_attempt(&self, attempt: &TaskAttempt) -> Result<bool, StoreError>;

    /// `None` if the task does not exist; otherwise the task after the request.
    async fn cancel(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<(Task, CancelOutcome)>, StoreError>;

    /// Ascending by attempt number.
    async fn list_attempts(&self, id: TaskId) -> Result<Vec<TaskAttempt>, StoreError>;

    /// Newest first.
    async fn list_artifacts(&self, id: TaskId) -> Result<Vec<TaskArtifact>, StoreError>;

    /// Running tasks whose lease ended before `now`, oldest lease first.
    async fn expired_leases(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Task>, StoreError>;

    /// Unprocessed outbox entries that are due at `due_at` and were created no
    /// later than `created_before`, oldest first.
    async fn pending_outbox(
        &self,
        due_at: DateTime<Utc>,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    async fn mark_outbox_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn insert(&self, task: Task, outbox: OutboxMessage) -> Result<InsertOutcome, StoreError> {
        (**self).insert(task, outbox).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        (**self).get(id).await
    }

    async fn find_by_idempotency(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Task>, StoreError> {
        (**self).find_by_idempotency(tenant_id, idempotency_key).await
    }

    async fn list(&self, query: &ListQuery) -> Result<Page<Task>, StoreError> {
        (**self).list(query).await
    }

    async fn claim(
        &self,
        id: TaskId,
        worker: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        (**self).claim(id, worker, now, lease).await
    }

    async fn insert_attempt(&self, attempt: &TaskAttempt) -> Result<bool, StoreError> {
        (**self).insert_attempt(attempt).await
    }

    async fn reconcile(&self, unit: Reconciliation) -> Result<ReconcileOutcome, StoreError> {
        (**self).reconcile(unit).await
    }

    async fn finalize_attempt(&self, attempt: &TaskAttempt) -> Result<bool, StoreError> {
        (**self).finalize_attempt(attempt).await
    }

    async fn cancel(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<(Task, CancelOutcome)>, StoreError> {
        (**self).cancel(id, now).await
    }

    async fn list_attempts(&self, id: TaskId) -> Result<Vec<TaskAttempt>, StoreError> {
        (**self).list_attempts(id).await
    }

    async fn list_artifacts(&self, id: TaskId) -> Result<Vec<TaskArtifact>, StoreError> {
        (**self).list_artifacts(id).await
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Task>, StoreError> {
        (**self).expired_leases(now, limit).await
    }

    async fn pending_outbox(
        &self,
        due_at: DateTime<Utc>,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        (**self).pending_outbox(due_at, created_before, limit).await
    }

    async fn mark_outbox_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).mark_outbox_processed(id, now).await
    }
}
