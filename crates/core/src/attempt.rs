//! Execution attempts.
//!
//! One attempt is recorded per claim. Attempts are created Running and
//! finalized exactly once; afterwards they are read-only history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{AttemptId, TaskId};
use crate::status::AttemptStatus;

/// Executor raised a retryable error.
pub const AI_TRANSIENT_ERROR: &str = "AI_TRANSIENT_ERROR";
/// Executor failed for any other reason.
pub const AI_EXEC_ERROR: &str = "AI_EXEC_ERROR";
/// Worker lost its lease before reporting back.
pub const LEASE_EXPIRED: &str = "LEASE_EXPIRED";

pub const MODEL_MAX_LEN: usize = 120;
pub const ERROR_CODE_MAX_LEN: usize = 60;

/// Usage reported by an executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub model: Option<String>,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
    pub cost: Option<f64>,
}

impl ExecutionMetrics {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tokens(mut self, tokens_in: u32, tokens_out: u32) -> Self {
        self.tokens_in = Some(tokens_in);
        self.tokens_out = Some(tokens_out);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Every persisted column of an attempt.
#[derive(Debug, Clone)]
pub struct AttemptParts {
    pub id: AttemptId,
    pub task_id: TaskId,
    pub attempt_no: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub executor: Option<String>,
    pub metrics: ExecutionMetrics,
    pub latency_ms: Option<u64>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAttempt {
    id: AttemptId,
    task_id: TaskId,
    attempt_no: u32,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    status: AttemptStatus,
    executor: Option<String>,
    metrics: ExecutionMetrics,
    latency_ms: Option<u64>,
    error_code: Option<String>,
    error_detail: Option<String>,
}

fn truncate(value: String, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value,
    }
}

impl TaskAttempt {
    /// A new Running attempt. `attempt_no` is 1-based.
    pub fn start(task_id: TaskId, attempt_no: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: AttemptId::new(),
            task_id,
            attempt_no,
            started_at: now,
            ended_at: None,
            status: AttemptStatus::Running,
            executor: None,
            metrics: ExecutionMetrics::default(),
            latency_ms: None,
            error_code: None,
            error_detail: None,
        }
    }

    pub fn from_parts(parts: AttemptParts) -> Self {
        Self {
            id: parts.id,
            task_id: parts.task_id,
            attempt_no: parts.attempt_no,
            started_at: parts.started_at,
            ended_at: parts.ended_at,
            status: parts.status,
            executor: parts.executor,
            metrics: parts.metrics,
            latency_ms: parts.latency_ms,
            error_code: parts.error_code,
            error_detail: parts.error_detail,
        }
    }

    pub fn complete_success(
        &mut self,
        executor: impl Into<String>,
        mut metrics: ExecutionMetrics,
        latency_ms: u64,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_open()?;
        metrics.model = metrics.model.map(|m| truncate(m, MODEL_MAX_LEN));
        self.status = AttemptStatus::Succeeded;
        self.executor = Some(executor.into());
        self.metrics = metrics;
        self.latency_ms = Some(latency_ms);
        self.ended_at = Some(now);
        Ok(())
    }

    pub fn complete_failure(
        &mut self,
        code: &str,
        detail: impl Into<String>,
        latency_ms: Option<u64>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_open()?;
        self.status = AttemptStatus::Failed;
        self.error_code = Some(truncate(code.to_string(), ERROR_CODE_MAX_LEN));
        self.error_detail = Some(detail.into());
        self.latency_ms = latency_ms;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Record which executor ran the attempt (set on failures too).
    pub fn set_executor(&mut self, executor: impl Into<String>) {
        if self.status == AttemptStatus::Running {
            self.executor = Some(executor.into());
        }
    }

    pub fn id(&self) -> AttemptId {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn attempt_no(&self) -> u32 {
        self.attempt_no
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn status(&self) -> AttemptStatus {
        self.status
    }

    pub fn executor(&self) -> Option<&str> {
        self.executor.as_deref()
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    pub fn is_finalized(&self) -> bool {
        self.status != AttemptStatus::Running
    }

    fn ensure_open(&self) -> DomainResult<()> {
        if self.is_finalized() {
            return Err(DomainError::invalid_transition(format!(
                "attempt {} of task {} is already {}",
                self.attempt_no, self.task_id, self.status
            )));
        }
        Ok(())
    }
}
