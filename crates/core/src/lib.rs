//! `taskforge-core`: task domain building blocks.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, classifications, the `Task` lifecycle state machine,
//! execution attempts, artifacts and the retry backoff policy.

pub mod artifact;
pub mod attempt;
pub mod classification;
pub mod error;
pub mod id;
pub mod retry;
pub mod status;
pub mod task;

pub use artifact::TaskArtifact;
pub use attempt::{AttemptParts, ExecutionMetrics, TaskAttempt};
pub use classification::{CapabilityType, DomainType, ExecutionType};
pub use error::{DomainError, DomainResult};
pub use id::{ArtifactId, AttemptId, CorrelationId, TaskId, TenantId};
pub use retry::{BackoffPolicy, BackoffStrategy};
pub use status::{AttemptStatus, TaskStatus};
pub use task::{CancelOutcome, LeaseFence, NewTask, RetryDecision, Task, TaskParts};
