use serde::{Deserialize, Serialize};
use taskforge_core::{DomainType, ExecutionMetrics};
use thiserror::Error;

/// Successful output of an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Result text, persisted as a `text` artifact.
    pub content: String,

    /// Model/token/cost usage, recorded on the attempt.
    pub metrics: ExecutionMetrics,
}

impl ExecutionOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metrics: ExecutionMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: ExecutionMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Why an execution did not produce output.
///
/// Every variant consumes one attempt from the task's budget; the variant only
/// decides the error code recorded on the attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// Temporary provider problem; retrying later may succeed.
    #[error("transient execution error: {0}")]
    Transient(String),

    #[error("execution failed: {0}")]
    Failed(String),

    /// Execution was interrupted (worker shutdown or timeout).
    #[error("execution cancelled: {0}")]
    Cancelled(String),
}

impl ExecutionError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Cancellation counts as transient: the work was never judged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Cancelled(_))
    }
}

/// Wiring mistakes in the executor set. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("No task executor registered for domain '{0}'.")]
    UnregisteredDomain(DomainType),

    #[error("more than one task executor registered for domain '{0}'")]
    DuplicateDomain(DomainType),
}
