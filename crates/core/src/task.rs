//! The `Task` entity and its lifecycle state machine.
//!
//! ```text
//! Queued ──claim──▶ Running ──success──────────────▶ Succeeded
//!   ▲                  │
//!   └──retry (budget)──┤──failure, budget exhausted─▶ DeadLetter
//!                      │
//! Queued/Running ──────┴──cancel───────────────────▶ Cancelled
//! ```
//!
//! Fields are private. Every mutation goes through a transition method that
//! checks the current state first, so a `Task` value can never describe an
//! impossible combination (e.g. a lease on a queued task).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classification::{CapabilityType, DomainType, ExecutionType};
use crate::error::{DomainError, DomainResult};
use crate::id::{TaskId, TenantId};
use crate::retry::BackoffPolicy;
use crate::status::TaskStatus;

pub const IDEMPOTENCY_KEY_MAX_LEN: usize = 120;
pub const WORKER_ID_MAX_LEN: usize = 120;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Input for [`Task::new`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub tenant_id: TenantId,
    pub domain: DomainType,
    pub capability: CapabilityType,
    pub execution: ExecutionType,
    pub priority: i32,
    /// JSON document, as text.
    pub payload: String,
    pub idempotency_key: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_attempts: u32,
}

/// Every persisted column of a task; used to rehydrate from storage.
#[derive(Debug, Clone)]
pub struct TaskParts {
    pub id: TaskId,
    pub tenant_id: TenantId,
    pub domain: DomainType,
    pub capability: CapabilityType,
    pub execution: ExecutionType,
    pub priority: i32,
    pub payload: String,
    pub idempotency_key: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Identifies one specific claim of a task.
///
/// A reconciliation write is only valid while the task is still Running under
/// the same worker and attempt number that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseFence {
    pub locked_by: String,
    pub attempt_count: u32,
}

/// What happens to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to Queued; claimable from `available_at`.
    Retry {
        attempt: u32,
        available_at: DateTime<Utc>,
    },
    /// Budget exhausted.
    DeadLetter,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Already cancelled; nothing changed.
    AlreadyCancelled,
    /// Succeeded or dead-lettered tasks cannot be cancelled.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    tenant_id: TenantId,
    domain: DomainType,
    capability: CapabilityType,
    execution: ExecutionType,
    priority: i32,
    payload: String,
    idempotency_key: String,
    scheduled_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    locked_until: Option<DateTime<Utc>>,
    attempt_count: u32,
    max_attempts: u32,
    last_error: Option<String>,
    status: TaskStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Task {
    /// Validate the input and create a fresh Queued task.
    pub fn new(input: NewTask, now: DateTime<Utc>) -> DomainResult<Self> {
        let idempotency_key = input.idempotency_key.trim().to_string();
        if idempotency_key.is_empty() {
            return Err(DomainError::validation(
                "idempotency_key",
                "Idempotency-Key header is required",
            ));
        }
        if idempotency_key.chars().count() > IDEMPOTENCY_KEY_MAX_LEN {
            return Err(DomainError::validation(
                "idempotency_key",
                format!("idempotency key must be at most {IDEMPOTENCY_KEY_MAX_LEN} characters"),
            ));
        }
        if input.payload.trim().is_empty() {
            return Err(DomainError::validation("payload", "payload is required"));
        }
        if serde_json::from_str::<serde_json::Value>(&input.payload).is_err() {
            return Err(DomainError::validation("payload", "payload must be valid JSON"));
        }
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&input.max_attempts) {
            return Err(DomainError::validation(
                "max_attempts",
                format!("max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}"),
            ));
        }

        Ok(Self {
            id: TaskId::new(),
            tenant_id: input.tenant_id,
            domain: input.domain,
            capability: input.capability,
            execution: input.execution,
            priority: input.priority,
            payload: input.payload,
            idempotency_key,
            scheduled_at: input.scheduled_at,
            locked_by: None,
            locked_until: None,
            attempt_count: 0,
            max_attempts: input.max_attempts,
            last_error: None,
            status: TaskStatus::Queued,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rehydrate from storage. No validation: stored rows are trusted.
    pub fn from_parts(parts: TaskParts) -> Self {
        Self {
            id: parts.id,
            tenant_id: parts.tenant_id,
            domain: parts.domain,
            capability: parts.capability,
            execution: parts.execution,
            priority: parts.priority,
            payload: parts.payload,
            idempotency_key: parts.idempotency_key,
            scheduled_at: parts.scheduled_at,
            locked_by: parts.locked_by,
            locked_until: parts.locked_until,
            attempt_count: parts.attempt_count,
            max_attempts: parts.max_attempts,
            last_error: parts.last_error,
            status: parts.status,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn domain(&self) -> DomainType {
        self.domain
    }

    pub fn capability(&self) -> CapabilityType {
        self.capability
    }

    pub fn execution(&self) -> ExecutionType {
        self.execution
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    pub fn locked_by(&self) -> Option<&str> {
        self.locked_by.as_deref()
    }

    pub fn locked_until(&self) -> Option<DateTime<Utc>> {
        self.locked_until
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether the task is due at `now` (no schedule, or schedule reached).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// The claim predicate. Stores must apply the same condition atomically.
    pub fn can_be_claimed(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Queued
            && self.locked_until.is_none_or(|until| until < now)
            && self.is_due(now)
            && self.attempt_count < self.max_attempts
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running && self.locked_until.is_some_and(|until| until < now)
    }

    /// The fence identifying the current claim, if Running.
    pub fn lease_fence(&self) -> Option<LeaseFence> {
        match (&self.status, &self.locked_by) {
            (TaskStatus::Running, Some(worker)) => Some(LeaseFence {
                locked_by: worker.clone(),
                attempt_count: self.attempt_count,
            }),
            _ => None,
        }
    }

    pub fn holds_lease(&self, fence: &LeaseFence) -> bool {
        self.status == TaskStatus::Running
            && self.locked_by.as_deref() == Some(fence.locked_by.as_str())
            && self.attempt_count == fence.attempt_count
    }

    /// Queued → Running under `worker` for `lease`.
    pub fn claim(&mut self, worker: &str, now: DateTime<Utc>, lease: Duration) -> DomainResult<()> {
        let worker = worker.trim();
        if worker.is_empty() || worker.chars().count() > WORKER_ID_MAX_LEN {
            return Err(DomainError::validation(
                "locked_by",
                format!("worker id must be 1..={WORKER_ID_MAX_LEN} characters"),
            ));
        }
        if !self.can_be_claimed(now) {
            return Err(DomainError::invalid_transition(format!(
                "task {} cannot be claimed in status {}",
                self.id, self.status
            )));
        }
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| DomainError::validation("lease", e.to_string()))?;

        self.status = TaskStatus::Running;
        self.locked_by = Some(worker.to_string());
        self.locked_until = Some(now + lease);
        self.attempt_count += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Running → Succeeded.
    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_running("succeed")?;
        self.status = TaskStatus::Succeeded;
        self.release_lease();
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    /// Running → Queued (budget left) or DeadLetter (budget exhausted).
    ///
    /// On retry the task is rescheduled `backoff.delay_for_attempt(id, n)` into the
    /// future, so notifications arriving before then cannot claim it.
    pub fn mark_attempt_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
    ) -> DomainResult<RetryDecision> {
        self.ensure_running("fail")?;
        self.release_lease();
        self.last_error = Some(error.into());
        self.updated_at = now;

        if self.attempt_count < self.max_attempts {
            let delay = backoff.delay_for_attempt(self.id, self.attempt_count);
            let available_at = if delay.is_zero() {
                now
            } else {
                let delay = chrono::Duration::from_std(delay)
                    .map_err(|e| DomainError::validation("backoff", e.to_string()))?;
                let at = now + delay;
                self.scheduled_at = Some(at);
                at
            };
            self.status = TaskStatus::Queued;
            Ok(RetryDecision::Retry {
                attempt: self.attempt_count,
                available_at,
            })
        } else {
            self.status = TaskStatus::DeadLetter;
            Ok(RetryDecision::DeadLetter)
        }
    }

    /// Recover a Running task whose lease ran out. Same budget rule as a
    /// failed attempt.
    pub fn expire_lease(
        &mut self,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
    ) -> DomainResult<RetryDecision> {
        if !self.is_lease_expired(now) {
            return Err(DomainError::invalid_transition(format!(
                "task {} does not hold an expired lease",
                self.id
            )));
        }
        self.mark_attempt_failed("lease expired", now, backoff)
    }

    /// Queued/Running → Cancelled. Cancelling twice is a no-op.
    pub fn try_cancel(&mut self, now: DateTime<Utc>) -> CancelOutcome {
        match self.status {
            TaskStatus::Queued | TaskStatus::Running => {
                self.status = TaskStatus::Cancelled;
                self.release_lease();
                self.updated_at = now;
                CancelOutcome::Cancelled
            }
            TaskStatus::Cancelled => CancelOutcome::AlreadyCancelled,
            TaskStatus::Succeeded | TaskStatus::DeadLetter => CancelOutcome::Rejected,
        }
    }

    fn ensure_running(&self, action: &str) -> DomainResult<()> {
        if self.status != TaskStatus::Running {
            return Err(DomainError::invalid_transition(format!(
                "cannot {action} task {} in status {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    fn release_lease(&mut self) {
        self.locked_by = None;
        self.locked_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LEASE: Duration = Duration::from_secs(600);

    fn new_task(max_attempts: u32) -> NewTask {
        NewTask {
            tenant_id: TenantId::parse("tenant-a").unwrap(),
            domain: DomainType::DocumentProcessing,
            capability: CapabilityType::LlmGeneration,
            execution: ExecutionType::Async,
            priority: 0,
            payload: r#"{"text":"hello"}"#.to_string(),
            idempotency_key: "key-1".to_string(),
            scheduled_at: None,
            max_attempts,
        }
    }

    fn queued(max_attempts: u32) -> Task {
        Task::new(new_task(max_attempts), Utc::now()).unwrap()
    }

    #[test]
    fn new_task_is_queued_without_lease() {
        let task = queued(3);
        assert_eq!(task.status(), TaskStatus::Queued);
        assert_eq!(task.attempt_count(), 0);
        assert!(task.locked_by().is_none());
        assert!(task.locked_until().is_none());
    }

    #[test]
    fn validation_names_the_field() {
        let now = Utc::now();
        let mut input = new_task(3);
        input.idempotency_key = "  ".into();
        assert_eq!(Task::new(input, now).unwrap_err().field(), Some("idempotency_key"));

        let mut input = new_task(3);
        input.idempotency_key = "k".repeat(IDEMPOTENCY_KEY_MAX_LEN + 1);
        assert_eq!(Task::new(input, now).unwrap_err().field(), Some("idempotency_key"));

        let mut input = new_task(3);
        input.payload = "".into();
        assert_eq!(Task::new(input, now).unwrap_err().field(), Some("payload"));

        let mut input = new_task(3);
        input.payload = "{not json".into();
        assert_eq!(Task::new(input, now).unwrap_err().field(), Some("payload"));

        assert_eq!(Task::new(new_task(0), now).unwrap_err().field(), Some("max_attempts"));
        assert_eq!(Task::new(new_task(11), now).unwrap_err().field(), Some("max_attempts"));
        assert!(Task::new(new_task(10), now).is_ok());
    }

    #[test]
    fn claim_sets_lease_and_bumps_attempt() {
        let now = Utc::now();
        let mut task = queued(3);
        task.claim("worker-1", now, LEASE).unwrap();

        assert_eq!(task.status(), TaskStatus::Running);
        assert_eq!(task.locked_by(), Some("worker-1"));
        assert_eq!(task.locked_until(), Some(now + chrono::Duration::seconds(600)));
        assert_eq!(task.attempt_count(), 1);
        assert_eq!(
            task.lease_fence(),
            Some(LeaseFence { locked_by: "worker-1".into(), attempt_count: 1 })
        );
    }

    #[test]
    fn running_task_cannot_be_claimed_again() {
        let now = Utc::now();
        let mut task = queued(3);
        task.claim("worker-1", now, LEASE).unwrap();
        assert!(!task.can_be_claimed(now));
        assert!(task.claim("worker-2", now, LEASE).is_err());
        assert_eq!(task.locked_by(), Some("worker-1"));
    }

    #[test]
    fn future_schedule_blocks_claim() {
        let now = Utc::now();
        let mut input = new_task(3);
        input.scheduled_at = Some(now + chrono::Duration::minutes(5));
        let task = Task::new(input, now).unwrap();
        assert!(!task.can_be_claimed(now));
        assert!(task.can_be_claimed(now + chrono::Duration::minutes(6)));
    }

    #[test]
    fn success_clears_lease_and_error() {
        let now = Utc::now();
        let mut task = queued(3);
        task.claim("w", now, LEASE).unwrap();
        task.mark_attempt_failed("boom", now, &BackoffPolicy::immediate()).unwrap();
        task.claim("w", now, LEASE).unwrap();
        task.mark_succeeded(now).unwrap();

        assert_eq!(task.status(), TaskStatus::Succeeded);
        assert!(task.last_error().is_none());
        assert!(task.locked_by().is_none());
        assert_eq!(task.attempt_count(), 2);
    }

    #[test]
    fn failures_exhaust_budget_into_dead_letter() {
        let now = Utc::now();
        let mut task = queued(3);
        let backoff = BackoffPolicy::immediate();

        for expected in 1..=2 {
            task.claim("w", now, LEASE).unwrap();
            let decision = task.mark_attempt_failed("transient", now, &backoff).unwrap();
            assert_eq!(decision, RetryDecision::Retry { attempt: expected, available_at: now });
            assert_eq!(task.status(), TaskStatus::Queued);
        }

        task.claim("w", now, LEASE).unwrap();
        let decision = task.mark_attempt_failed("transient", now, &backoff).unwrap();
        assert_eq!(decision, RetryDecision::DeadLetter);
        assert_eq!(task.status(), TaskStatus::DeadLetter);
        assert_eq!(task.attempt_count(), 3);
        assert_eq!(task.last_error(), Some("transient"));
        assert!(task.locked_until().is_none());
    }

    #[test]
    fn backoff_reschedules_retry() {
        let now = Utc::now();
        let mut task = queued(3);
        task.claim("w", now, LEASE).unwrap();
        let backoff = BackoffPolicy::fixed(Duration::from_secs(30));
        let decision = task.mark_attempt_failed("later", now, &backoff).unwrap();

        let at = now + chrono::Duration::seconds(30);
        assert_eq!(decision, RetryDecision::Retry { attempt: 1, available_at: at });
        assert_eq!(task.scheduled_at(), Some(at));
        assert!(!task.can_be_claimed(now));
        assert!(task.can_be_claimed(at + chrono::Duration::seconds(1)));
    }

    #[test]
    fn cancel_rules() {
        let now = Utc::now();
        let mut task = queued(1);
        assert_eq!(task.try_cancel(now), CancelOutcome::Cancelled);
        assert_eq!(task.try_cancel(now), CancelOutcome::AlreadyCancelled);
        assert!(!task.can_be_claimed(now));

        let mut running = queued(1);
        running.claim("w", now, LEASE).unwrap();
        assert_eq!(running.try_cancel(now), CancelOutcome::Cancelled);
        assert!(running.locked_by().is_none());

        let mut done = queued(1);
        done.claim("w", now, LEASE).unwrap();
        done.mark_succeeded(now).unwrap();
        assert_eq!(done.try_cancel(now), CancelOutcome::Rejected);
        assert_eq!(done.status(), TaskStatus::Succeeded);

        let mut dead = queued(1);
        dead.claim("w", now, LEASE).unwrap();
        dead.mark_attempt_failed("x", now, &BackoffPolicy::immediate()).unwrap();
        assert_eq!(dead.try_cancel(now), CancelOutcome::Rejected);
        assert_eq!(dead.status(), TaskStatus::DeadLetter);
    }

    #[test]
    fn cancelled_task_no_longer_holds_lease() {
        let now = Utc::now();
        let mut task = queued(2);
        task.claim("w", now, LEASE).unwrap();
        let fence = task.lease_fence().unwrap();
        task.try_cancel(now);
        assert!(!task.holds_lease(&fence));
    }

    #[test]
    fn lease_expiry_requeues_then_dead_letters() {
        let now = Utc::now();
        let later = now + chrono::Duration::minutes(11);
        let mut task = queued(2);
        task.claim("w", now, LEASE).unwrap();
        assert!(task.expire_lease(now, &BackoffPolicy::immediate()).is_err());

        let decision = task.expire_lease(later, &BackoffPolicy::immediate()).unwrap();
        assert!(matches!(decision, RetryDecision::Retry { attempt: 1, .. }));
        assert_eq!(task.last_error(), Some("lease expired"));

        task.claim("w", later, LEASE).unwrap();
        let much_later = later + chrono::Duration::minutes(11);
        let decision = task.expire_lease(much_later, &BackoffPolicy::immediate()).unwrap();
        assert_eq!(decision, RetryDecision::DeadLetter);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Claim,
        Succeed,
        Fail,
        Cancel,
        Expire,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Claim),
            Just(Op::Succeed),
            Just(Op::Fail),
            Just(Op::Cancel),
            Just(Op::Expire),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn lifecycle_invariants_hold_for_any_sequence(
            max_attempts in 1u32..=10,
            ops in prop::collection::vec(op(), 0..40),
        ) {
            let mut now = Utc::now();
            let backoff = BackoffPolicy::immediate();
            let mut task = queued(max_attempts);
            let mut last_count = 0;
            let mut was_terminal = false;

            for op in ops {
                now += chrono::Duration::seconds(1);
                let before = task.status();
                let _ = match op {
                    Op::Claim => task.claim("w", now, LEASE).map(|_| ()),
                    Op::Succeed => task.mark_succeeded(now),
                    Op::Fail => task.mark_attempt_failed("e", now, &backoff).map(|_| ()),
                    Op::Cancel => { task.try_cancel(now); Ok(()) }
                    Op::Expire => {
                        now += chrono::Duration::minutes(11);
                        task.expire_lease(now, &backoff).map(|_| ())
                    }
                };

                prop_assert!(task.attempt_count() >= last_count);
                prop_assert!(task.attempt_count() <= task.max_attempts());
                prop_assert_eq!(
                    task.locked_by().is_some(),
                    task.status() == TaskStatus::Running
                );
                prop_assert_eq!(
                    task.locked_until().is_some(),
                    task.status() == TaskStatus::Running
                );
                if was_terminal {
                    prop_assert_eq!(task.status(), before);
                }
                last_count = task.attempt_count();
                was_terminal = task.status().is_terminal();
            }
        }
    }
}
