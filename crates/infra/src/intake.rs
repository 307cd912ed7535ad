//! Task intake: validated, idempotent creation plus the read/cancel surface.

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};

use taskforge_core::{
    CancelOutcome, DomainError, NewTask, Task, TaskArtifact, TaskAttempt, TaskId, TaskStatus,
};
use taskforge_events::{OutboxError, OutboxMessage, TaskQueue, TaskQueued};

use crate::outbox::dispatch_entry;
use crate::store::{InsertOutcome, ListQuery, Page, StoreError, TaskStore};

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("task {0} not found")]
    NotFound(TaskId),

    /// Cancellation refused because the task already finished.
    #[error("task {id} is {status} and can no longer be cancelled")]
    Rejected { id: TaskId, status: TaskStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// Result of [`IntakeService::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub task: Task,
    /// `false` when the idempotency key matched an existing task.
    pub created: bool,
}

pub struct IntakeService<S, Q> {
    store: S,
    queue: Q,
}

impl<S, Q> IntakeService<S, Q>
where
    S: TaskStore,
    Q: TaskQueue,
{
    pub fn new(store: S, queue: Q) -> Self {
        Self { store, queue }
    }

    /// Create a task, or return the one already created under the same
    /// `(tenant, idempotency_key)`.
    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id, domain = %input.domain), err)]
    pub async fn create(&self, input: NewTask) -> Result<Created, IntakeError> {
        let now = Utc::now();
        let task = Task::new(input, now)?;

        if let Some(existing) = self
            .store
            .find_by_idempotency(task.tenant_id(), task.idempotency_key())
            .await?
        {
            return Ok(Created {
                task: existing,
                created: false,
            });
        }

        let message = TaskQueued::initial(task.id(), task.tenant_id().clone(), task.capability());
        let available_at = task.scheduled_at().unwrap_or(now);
        let entry = OutboxMessage::task_queued(&message, now, available_at)?;

        match self.store.insert(task, entry.clone()).await? {
            InsertOutcome::Inserted(task) => {
                info!(
                    task_id = %task.id(),
                    correlation_id = %message.correlation_id,
                    "task accepted"
                );
                if entry.is_due(now) {
                    dispatch_entry(&self.store, &self.queue, &entry, now).await;
                }
                Ok(Created { task, created: true })
            }
            InsertOutcome::Duplicate(task) => Ok(Created {
                task,
                created: false,
            }),
        }
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<Task>, IntakeError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list(&self, query: &ListQuery) -> Result<Page<Task>, IntakeError> {
        if query.page < 1 {
            return Err(DomainError::validation("page", "page must be at least 1").into());
        }
        if !(1..=MAX_PAGE_SIZE).contains(&query.page_size) {
            return Err(DomainError::validation(
                "page_size",
                format!("page_size must be between 1 and {MAX_PAGE_SIZE}"),
            )
            .into());
        }
        Ok(self.store.list(query).await?)
    }

    /// `Ok(None)` for an unknown id.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, id: TaskId) -> Result<Option<Task>, IntakeError> {
        match self.store.cancel(id, Utc::now()).await? {
            None => Ok(None),
            Some((task, CancelOutcome::Rejected)) => Err(IntakeError::Rejected {
                id,
                status: task.status(),
            }),
            Some((task, outcome)) => {
                info!(task_id = %id, outcome = ?outcome, "task cancelled");
                Ok(Some(task))
            }
        }
    }

    pub async fn list_attempts(&self, id: TaskId) -> Result<Vec<TaskAttempt>, IntakeError> {
        self.ensure_exists(id).await?;
        Ok(self.store.list_attempts(id).await?)
    }

    pub async fn list_artifacts(&self, id: TaskId) -> Result<Vec<TaskArtifact>, IntakeError> {
        self.ensure_exists(id).await?;
        Ok(self.store.list_artifacts(id).await?)
    }

    async fn ensure_exists(&self, id: TaskId) -> Result<(), IntakeError> {
        match self.store.get(id).await? {
            Some(_) => Ok(()),
            None => Err(IntakeError::NotFound(id)),
        }
    }
}
