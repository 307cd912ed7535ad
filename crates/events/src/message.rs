//! Queue message types.

use serde::{Deserialize, Serialize};
use taskforge_core::{CapabilityType, CorrelationId, TaskId, TenantId};

/// "A task is ready to be claimed."
///
/// Carries only routing data. The task row is the source of truth: a worker
/// receiving this message re-reads the task and may find the notification
/// stale (already claimed, cancelled, rescheduled).
///
/// `attempt` is the number of attempts already made when the message was
/// published (0 for the first dispatch). `correlation_id` is shared by every
/// notification for the same task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueued {
    pub task_id: TaskId,
    pub tenant_id: TenantId,
    pub capability: CapabilityType,
    pub attempt: u32,
    pub correlation_id: CorrelationId,
}

impl TaskQueued {
    /// First dispatch of a freshly created task.
    pub fn initial(task_id: TaskId, tenant_id: TenantId, capability: CapabilityType) -> Self {
        Self {
            task_id,
            tenant_id,
            capability,
            attempt: 0,
            correlation_id: CorrelationId::new(),
        }
    }

    /// Re-dispatch after `attempt` attempts, keeping the correlation id.
    pub fn retry(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_keeps_correlation() {
        let first = TaskQueued::initial(
            TaskId::new(),
            TenantId::parse("t1").unwrap(),
            CapabilityType::LlmReasoning,
        );
        let second = first.retry(2);
        assert_eq!(first.attempt, 0);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.correlation_id, first.correlation_id);
        assert_eq!(second.task_id, first.task_id);
    }

    #[test]
    fn wire_format_is_snake_case_json() {
        let msg = TaskQueued::initial(
            TaskId::new(),
            TenantId::parse("t1").unwrap(),
            CapabilityType::VisionOcr,
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["capability"], "vision_ocr");
        assert_eq!(json["tenant_id"], "t1");
        assert_eq!(json["attempt"], 0);
    }
}
