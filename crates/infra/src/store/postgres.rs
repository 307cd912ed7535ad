//! Postgres-backed task store.
//!
//! Schema lives in `crates/infra/migrations/` and is applied by
//! [`PostgresTaskStore::migrate`].
//!
//! ## Concurrency
//!
//! | Operation | Mechanism |
//! |-----------|-----------|
//! | `insert` | `ON CONFLICT (tenant_id, idempotency_key) DO NOTHING`, then re-read the winner |
//! | `claim` | single conditional `UPDATE`; `rows_affected() == 1` means the lease is ours |
//! | `insert_attempt` | `ON CONFLICT (task_id, attempt_no) DO NOTHING` |
//! | `reconcile` | fenced `UPDATE ... WHERE locked_by = $ AND attempt_count = $` inside a transaction |
//! | `cancel` | conditional `UPDATE ... RETURNING`, then classify on miss |
//!
//! ## Error mapping
//!
//! | Postgres code | `StoreError` |
//! |---------------|--------------|
//! | `23505` unique violation | `Conflict` |
//! | `23503` / `23514` | `Storage` |
//! | anything else, pool closed, IO | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use taskforge_core::{
    ArtifactId, AttemptId, AttemptParts, CancelOutcome, ExecutionMetrics, Task, TaskArtifact,
    TaskAttempt, TaskId, TaskParts, TaskStatus, TenantId,
};
use taskforge_events::OutboxMessage;

use super::r#trait::{
    InsertOutcome, ListQuery, Page, ReconcileOutcome, Reconciliation, StoreError, TaskStore,
};

const SCHEMA: &str = include_str!("../../migrations/0001_create_tasks.sql");

/// Postgres-backed task store.
///
/// `Send + Sync`; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if missing. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(
        skip(self, task, outbox),
        fields(task_id = %task.id(), tenant_id = %task.tenant_id(), duplicate),
        err
    )]
    async fn insert(&self, task: Task, outbox: OutboxMessage) -> Result<InsertOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO tasks (
                id, tenant_id, domain_type, capability_type, execution_type, priority,
                status, payload, idempotency_key, scheduled_at, locked_until, locked_by,
                max_attempts, attempt_count, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(*task.id().as_uuid())
        .bind(task.tenant_id().as_str())
        .bind(task.domain().as_str())
        .bind(task.capability().as_str())
        .bind(task.execution().as_str())
        .bind(task.priority())
        .bind(task.status().as_str())
        .bind(task.payload())
        .bind(task.idempotency_key())
        .bind(task.scheduled_at())
        .bind(task.locked_until())
        .bind(task.locked_by())
        .bind(task.max_attempts() as i32)
        .bind(task.attempt_count() as i32)
        .bind(task.last_error())
        .bind(task.created_at())
        .bind(task.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_task", e))?
        .rows_affected();

        if inserted == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            Span::current().record("duplicate", true);
            let existing = self
                .find_by_idempotency(task.tenant_id(), task.idempotency_key())
                .await?
                .ok_or_else(|| {
                    StoreError::Conflict(format!(
                        "idempotency key collision for task {} but no existing row",
                        task.id()
                    ))
                })?;
            return Ok(InsertOutcome::Duplicate(existing));
        }

        insert_outbox(&mut *tx, &outbox).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("duplicate", false);
        Ok(InsertOutcome::Inserted(task))
    }

    #[instrument(skip(self, id), fields(task_id = %id), err)]
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, domain_type, capability_type, execution_type, priority,
                   status, payload, idempotency_key, scheduled_at, locked_until, locked_by,
                   max_attempts, attempt_count, last_error, created_at, updated_at
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_task", e))?;

        row.map(|r| task_from_row(&r)).transpose()
    }

    #[instrument(skip(self, tenant_id), fields(tenant_id = %tenant_id), err)]
    async fn find_by_idempotency(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, domain_type, capability_type, execution_type, priority,
                   status, payload, idempotency_key, scheduled_at, locked_until, locked_by,
                   max_attempts, attempt_count, last_error, created_at, updated_at
            FROM tasks
            WHERE tenant_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(idempotency_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_idempotency", e))?;

        row.map(|r| task_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(page = query.page, page_size = query.page_size, total_count), err)]
    async fn list(&self, query: &ListQuery) -> Result<Page<Task>, StoreError> {
        let status = query.status.map(|s| s.as_str());
        let domain = query.domain.map(|d| d.as_str());
        let capability = query.capability.map(|c| c.as_str());
        let execution = query.execution.map(|e| e.as_str());
        let tenant = query.tenant_id.as_ref().map(TenantId::as_str);

        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM tasks
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR domain_type = $2)
              AND ($3::text IS NULL OR capability_type = $3)
              AND ($4::text IS NULL OR execution_type = $4)
              AND ($5::text IS NULL OR tenant_id = $5)
            "#,
        )
        .bind(status)
        .bind(domain)
        .bind(capability)
        .bind(execution)
        .bind(tenant)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_tasks", e))?;

        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| StoreError::Corrupt(format!("failed to read total: {e}")))?;

        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, domain_type, capability_type, execution_type, priority,
                   status, payload, idempotency_key, scheduled_at, locked_until, locked_by,
                   max_attempts, attempt_count, last_error, created_at, updated_at
            FROM tasks
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR domain_type = $2)
              AND ($3::text IS NULL OR capability_type = $3)
              AND ($4::text IS NULL OR execution_type = $4)
              AND ($5::text IS NULL OR tenant_id = $5)
            ORDER BY created_at DESC, id DESC
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(status)
        .bind(domain)
        .bind(capability)
        .bind(execution)
        .bind(tenant)
        .bind(i64::from(query.page_size))
        .bind(i64::try_from(query.offset()).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_tasks", e))?;

        let items = rows.iter().map(task_from_row).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("total_count", total);
        Ok(Page {
            items,
            total_count: u64::try_from(total).unwrap_or(0),
        })
    }

    #[instrument(skip(self, id, now, lease), fields(task_id = %id, claimed), err)]
    async fn claim(
        &self,
        id: TaskId,
        worker: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| StoreError::Storage(format!("invalid lease: {e}")))?;

        let affected = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'running',
                locked_by = $2,
                locked_until = $4,
                attempt_count = attempt_count + 1,
                updated_at = $3
            WHERE id = $1
              AND status = 'queued'
              AND (locked_until IS NULL OR locked_until < $3)
              AND (scheduled_at IS NULL OR scheduled_at <= $3)
              AND attempt_count < max_attempts
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker)
        .bind(now)
        .bind(now + lease)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_task", e))?
        .rows_affected();

        let claimed = affected == 1;
        Span::current().record("claimed", claimed);
        Ok(claimed)
    }

    #[instrument(
        skip(self, attempt),
        fields(task_id = %attempt.task_id(), attempt_no = attempt.attempt_no()),
        err
    )]
    async fn insert_attempt(&self, attempt: &TaskAttempt) -> Result<bool, StoreError> {
        let affected = bind_attempt(
            sqlx::query(
                r#"
                INSERT INTO task_attempts (
                    id, task_id, attempt_no, started_at, ended_at, status, executor, model,
                    tokens_in, tokens_out, cost, latency_ms, error_code, error_detail
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (task_id, attempt_no) DO NOTHING
                "#,
            ),
            attempt,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_attempt", e))?
        .rows_affected();

        Ok(affected == 1)
    }

    #[instrument(
        skip(self, unit),
        fields(
            task_id = %unit.task.id(),
            worker = %unit.fence.locked_by,
            attempt = unit.fence.attempt_count,
            status = %unit.task.status(),
            applied
        ),
        err
    )]
    async fn reconcile(&self, unit: Reconciliation) -> Result<ReconcileOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let task = &unit.task;
        let affected = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                locked_by = $3,
                locked_until = $4,
                attempt_count = $5,
                last_error = $6,
                scheduled_at = $7,
                updated_at = $8
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $9
              AND attempt_count = $10
            "#,
        )
        .bind(*task.id().as_uuid())
        .bind(task.status().as_str())
        .bind(task.locked_by())
        .bind(task.locked_until())
        .bind(task.attempt_count() as i32)
        .bind(task.last_error())
        .bind(task.scheduled_at())
        .bind(task.updated_at())
        .bind(&unit.fence.locked_by)
        .bind(unit.fence.attempt_count as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reconcile_task", e))?
        .rows_affected();

        if affected == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            Span::current().record("applied", false);
            return Ok(ReconcileOutcome::Superseded);
        }

        upsert_attempt(&mut *tx, &unit.attempt).await?;

        if let Some(artifact) = &unit.artifact {
            sqlx::query(
                r#"
                INSERT INTO task_artifacts (id, task_id, kind, uri, content, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(*artifact.id().as_uuid())
            .bind(*artifact.task_id().as_uuid())
            .bind(artifact.kind())
            .bind(artifact.uri())
            .bind(artifact.content())
            .bind(artifact.created_at())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_artifact", e))?;
        }

        if let Some(outbox) = &unit.outbox {
            insert_outbox(&mut *tx, outbox).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("applied", true);
        Ok(ReconcileOutcome::Applied)
    }

    #[instrument(
        skip(self, attempt),
        fields(task_id = %attempt.task_id(), attempt_no = attempt.attempt_no()),
        err
    )]
    async fn finalize_attempt(&self, attempt: &TaskAttempt) -> Result<bool, StoreError> {
        upsert_attempt(&*self.pool, attempt).await
    }

    #[instrument(skip(self, id, now), fields(task_id = %id), err)]
    async fn cancel(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<(Task, CancelOutcome)>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'cancelled', locked_by = NULL, locked_until = NULL, updated_at = $2
            WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING id, tenant_id, domain_type, capability_type, execution_type, priority,
                      status, payload, idempotency_key, scheduled_at, locked_until, locked_by,
                      max_attempts, attempt_count, last_error, created_at, updated_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel_task", e))?;

        if let Some(row) = row {
            return Ok(Some((task_from_row(&row)?, CancelOutcome::Cancelled)));
        }

        // Not cancellable by the update: either missing or already terminal.
        Ok(self.get(id).await?.map(|task| {
            let outcome = if task.status() == TaskStatus::Cancelled {
                CancelOutcome::AlreadyCancelled
            } else {
                CancelOutcome::Rejected
            };
            (task, outcome)
        }))
    }

    #[instrument(skip(self, id), fields(task_id = %id), err)]
    async fn list_attempts(&self, id: TaskId) -> Result<Vec<TaskAttempt>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, attempt_no, started_at, ended_at, status, executor, model,
                   tokens_in, tokens_out, cost, latency_ms, error_code, error_detail
            FROM task_attempts
            WHERE task_id = $1
            ORDER BY attempt_no ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_attempts", e))?;

        rows.iter()
            .map(|row| {
                AttemptRow::from_row(row)
                    .map_err(|e| StoreError::Corrupt(format!("failed to read attempt row: {e}")))?
                    .try_into()
            })
            .collect()
    }

    #[instrument(skip(self, id), fields(task_id = %id), err)]
    async fn list_artifacts(&self, id: TaskId) -> Result<Vec<TaskArtifact>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, kind, uri, content, created_at
            FROM task_artifacts
            WHERE task_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_artifacts", e))?;

        rows.iter()
            .map(|row| {
                let r = ArtifactRow::from_row(row)
                    .map_err(|e| StoreError::Corrupt(format!("failed to read artifact row: {e}")))?;
                Ok(r.into())
            })
            .collect()
    }

    #[instrument(skip(self, now), err)]
    async fn expired_leases(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, domain_type, capability_type, execution_type, priority,
                   status, payload, idempotency_key, scheduled_at, locked_until, locked_by,
                   max_attempts, attempt_count, last_error, created_at, updated_at
            FROM tasks
            WHERE status = 'running' AND locked_until < $1
            ORDER BY locked_until ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expired_leases", e))?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self, due_at, created_before), err)]
    async fn pending_outbox(
        &self,
        due_at: DateTime<Utc>,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, event_type, payload, created_at, available_at, processed_at
            FROM outbox_messages
            WHERE processed_at IS NULL
              AND available_at <= $1
              AND created_at <= $2
            ORDER BY available_at ASC
            LIMIT $3
            "#,
        )
        .bind(due_at)
        .bind(created_before)
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_outbox", e))?;

        rows.iter()
            .map(|row| {
                let r = OutboxRow::from_row(row)
                    .map_err(|e| StoreError::Corrupt(format!("failed to read outbox row: {e}")))?;
                Ok(r.into())
            })
            .collect()
    }

    #[instrument(skip(self, id, now), fields(outbox_id = %id), err)]
    async fn mark_outbox_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET processed_at = $2
            WHERE id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_outbox_processed", e))?;
        Ok(())
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_attempt<'q>(query: PgQuery<'q>, attempt: &'q TaskAttempt) -> PgQuery<'q> {
    let metrics = attempt.metrics();
    query
        .bind(*attempt.id().as_uuid())
        .bind(*attempt.task_id().as_uuid())
        .bind(attempt.attempt_no() as i32)
        .bind(attempt.started_at())
        .bind(attempt.ended_at())
        .bind(attempt.status().as_str())
        .bind(attempt.executor())
        .bind(metrics.model.as_deref())
        .bind(metrics.tokens_in.map(i64::from))
        .bind(metrics.tokens_out.map(i64::from))
        .bind(metrics.cost)
        .bind(attempt.latency_ms().map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)))
        .bind(attempt.error_code())
        .bind(attempt.error_detail())
}

/// Insert the attempt, or finish it if it is still Running.
async fn upsert_attempt<'e, E>(executor: E, attempt: &TaskAttempt) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let affected = bind_attempt(
        sqlx::query(
            r#"
            INSERT INTO task_attempts (
                id, task_id, attempt_no, started_at, ended_at, status, executor, model,
                tokens_in, tokens_out, cost, latency_ms, error_code, error_detail
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (task_id, attempt_no) DO UPDATE SET
                ended_at = EXCLUDED.ended_at,
                status = EXCLUDED.status,
                executor = EXCLUDED.executor,
                model = EXCLUDED.model,
                tokens_in = EXCLUDED.tokens_in,
                tokens_out = EXCLUDED.tokens_out,
                cost = EXCLUDED.cost,
                latency_ms = EXCLUDED.latency_ms,
                error_code = EXCLUDED.error_code,
                error_detail = EXCLUDED.error_detail
            WHERE task_attempts.status = 'running'
            "#,
        ),
        attempt,
    )
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("upsert_attempt", e))?
    .rows_affected();

    Ok(affected == 1)
}

async fn insert_outbox<'e, E>(executor: E, message: &OutboxMessage) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO outbox_messages (id, task_id, event_type, payload, created_at, available_at, processed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(message.id())
    .bind(message.task_id().map(|id| *id.as_uuid()))
    .bind(message.event_type())
    .bind(message.payload())
    .bind(message.created_at())
    .bind(message.available_at())
    .bind(message.processed_at())
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("insert_outbox", e))?;
    Ok(())
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    TaskRow::from_row(row)
        .map_err(|e| StoreError::Corrupt(format!("failed to read task row: {e}")))?
        .try_into()
}

fn corrupt(column: &str, err: impl core::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("column `{column}`: {err}"))
}

struct TaskRow {
    id: Uuid,
    tenant_id: String,
    domain_type: String,
    capability_type: String,
    execution_type: String,
    priority: i32,
    status: String,
    payload: String,
    idempotency_key: String,
    scheduled_at: Option<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    max_attempts: i32,
    attempt_count: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            domain_type: row.try_get("domain_type")?,
            capability_type: row.try_get("capability_type")?,
            execution_type: row.try_get("execution_type")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            idempotency_key: row.try_get("idempotency_key")?,
            scheduled_at: row.try_get("scheduled_at")?,
            locked_until: row.try_get("locked_until")?,
            locked_by: row.try_get("locked_by")?,
            max_attempts: row.try_get("max_attempts")?,
            attempt_count: row.try_get("attempt_count")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task::from_parts(TaskParts {
            id: TaskId::from_uuid(row.id),
            tenant_id: TenantId::parse(row.tenant_id).map_err(|e| corrupt("tenant_id", e))?,
            domain: row.domain_type.parse().map_err(|e| corrupt("domain_type", e))?,
            capability: row
                .capability_type
                .parse()
                .map_err(|e| corrupt("capability_type", e))?,
            execution: row
                .execution_type
                .parse()
                .map_err(|e| corrupt("execution_type", e))?,
            priority: row.priority,
            payload: row.payload,
            idempotency_key: row.idempotency_key,
            scheduled_at: row.scheduled_at,
            locked_by: row.locked_by,
            locked_until: row.locked_until,
            attempt_count: u32::try_from(row.attempt_count).map_err(|e| corrupt("attempt_count", e))?,
            max_attempts: u32::try_from(row.max_attempts).map_err(|e| corrupt("max_attempts", e))?,
            last_error: row.last_error,
            status: row.status.parse().map_err(|e| corrupt("status", e))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }
}

struct AttemptRow {
    id: Uuid,
    task_id: Uuid,
    attempt_no: i32,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    status: String,
    executor: Option<String>,
    model: Option<String>,
    tokens_in: Option<i64>,
    tokens_out: Option<i64>,
    cost: Option<f64>,
    latency_ms: Option<i64>,
    error_code: Option<String>,
    error_detail: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for AttemptRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            attempt_no: row.try_get("attempt_no")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            status: row.try_get("status")?,
            executor: row.try_get("executor")?,
            model: row.try_get("model")?,
            tokens_in: row.try_get("tokens_in")?,
            tokens_out: row.try_get("tokens_out")?,
            cost: row.try_get("cost")?,
            latency_ms: row.try_get("latency_ms")?,
            error_code: row.try_get("error_code")?,
            error_detail: row.try_get("error_detail")?,
        })
    }
}

impl TryFrom<AttemptRow> for TaskAttempt {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let tokens = |v: Option<i64>, column: &str| {
            v.map(u32::try_from).transpose().map_err(|e| corrupt(column, e))
        };
        Ok(TaskAttempt::from_parts(AttemptParts {
            id: AttemptId::from_uuid(row.id),
            task_id: TaskId::from_uuid(row.task_id),
            attempt_no: u32::try_from(row.attempt_no).map_err(|e| corrupt("attempt_no", e))?,
            started_at: row.started_at,
            ended_at: row.ended_at,
            status: row.status.parse().map_err(|e| corrupt("status", e))?,
            executor: row.executor,
            metrics: ExecutionMetrics {
                model: row.model,
                tokens_in: tokens(row.tokens_in, "tokens_in")?,
                tokens_out: tokens(row.tokens_out, "tokens_out")?,
                cost: row.cost,
            },
            latency_ms: row
                .latency_ms
                .map(u64::try_from)
                .transpose()
                .map_err(|e| corrupt("latency_ms", e))?,
            error_code: row.error_code,
            error_detail: row.error_detail,
        }))
    }
}

struct ArtifactRow {
    id: Uuid,
    task_id: Uuid,
    kind: String,
    uri: Option<String>,
    content: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ArtifactRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            kind: row.try_get("kind")?,
            uri: row.try_get("uri")?,
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<ArtifactRow> for TaskArtifact {
    fn from(row: ArtifactRow) -> Self {
        TaskArtifact::from_parts(
            ArtifactId::from_uuid(row.id),
            TaskId::from_uuid(row.task_id),
            row.kind,
            row.uri,
            row.content,
            row.created_at,
        )
    }
}

struct OutboxRow {
    id: Uuid,
    task_id: Option<Uuid>,
    event_type: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            available_at: row.try_get("available_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

impl From<OutboxRow> for OutboxMessage {
    fn from(row: OutboxRow) -> Self {
        OutboxMessage::from_parts(
            row.id,
            row.task_id.map(TaskId::from_uuid),
            row.event_type,
            row.payload,
            row.created_at,
            row.available_at,
            row.processed_at,
        )
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Storage(format!("unexpected row not found in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
