use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskforge_core::task::DEFAULT_MAX_ATTEMPTS;
use taskforge_core::{
    CapabilityType, DomainError, DomainType, ExecutionType, NewTask, Task, TaskArtifact,
    TaskAttempt, TaskStatus, TenantId,
};
use taskforge_infra::ListQuery;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(default)]
    pub domain_type: String,
    #[serde(default)]
    pub capability_type: Option<String>,
    /// Legacy alias for `capability_type`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub task_execution_type: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl CreateTaskRequest {
    /// Combine the body with the tenant and idempotency key from the headers.
    pub fn into_new_task(self, tenant_id: TenantId, idempotency_key: String) -> Result<NewTask, DomainError> {
        let capability = self
            .capability_type
            .filter(|c| !c.trim().is_empty())
            .or(self.kind)
            .unwrap_or_default();

        let payload = match self.payload {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(value) => value.to_string(),
        };

        Ok(NewTask {
            tenant_id,
            domain: DomainType::parse_field(&self.domain_type, "domain_type")?,
            capability: CapabilityType::parse_field(&capability, "capability_type")?,
            execution: ExecutionType::parse_field(&self.task_execution_type, "task_execution_type")?,
            priority: self.priority,
            payload,
            idempotency_key,
            scheduled_at: self.scheduled_at,
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTasksParams {
    pub status: Option<String>,
    pub domain_type: Option<String>,
    pub capability_type: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub task_execution_type: Option<String>,
    pub tenant_id: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

fn non_blank(raw: Option<String>) -> Option<String> {
    raw.filter(|v| !v.trim().is_empty())
}

impl ListTasksParams {
    /// Unrecognised filter values are validation errors, not empty results.
    pub fn into_query(self) -> Result<ListQuery, DomainError> {
        let defaults = ListQuery::default();
        let capability = non_blank(self.capability_type).or(non_blank(self.kind));

        Ok(ListQuery {
            status: non_blank(self.status).map(|s| s.parse::<TaskStatus>()).transpose()?,
            domain: non_blank(self.domain_type)
                .map(|d| DomainType::parse_field(&d, "domain_type"))
                .transpose()?,
            capability: capability
                .map(|c| CapabilityType::parse_field(&c, "capability_type"))
                .transpose()?,
            execution: non_blank(self.task_execution_type)
                .map(|e| ExecutionType::parse_field(&e, "task_execution_type"))
                .transpose()?,
            tenant_id: non_blank(self.tenant_id).map(|t| TenantId::parse(&t)).transpose()?,
            page: self.page.unwrap_or(defaults.page),
            page_size: self.page_size.unwrap_or(defaults.page_size),
        })
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub tenant_id: String,
    pub domain_type: &'static str,
    pub capability_type: &'static str,
    pub task_execution_type: &'static str,
    pub priority: i32,
    pub status: &'static str,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for TaskResponse {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id().to_string(),
            tenant_id: task.tenant_id().to_string(),
            domain_type: task.domain().as_str(),
            capability_type: task.capability().as_str(),
            task_execution_type: task.execution().as_str(),
            priority: task.priority(),
            status: task.status().as_str(),
            attempt_count: task.attempt_count(),
            max_attempts: task.max_attempts(),
            last_error: task.last_error().map(str::to_string),
            scheduled_at: task.scheduled_at(),
            created_at: task.created_at(),
            updated_at: task.updated_at(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskPageResponse {
    pub items: Vec<TaskResponse>,
    pub total_count: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Serialize)]
pub struct AttemptResponse {
    pub id: String,
    pub attempt_no: u32,
    pub status: &'static str,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub executor: Option<String>,
    pub model: Option<String>,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
    pub cost: Option<f64>,
    pub latency_ms: Option<u64>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
}

impl From<&TaskAttempt> for AttemptResponse {
    fn from(attempt: &TaskAttempt) -> Self {
        let metrics = attempt.metrics();
        Self {
            id: attempt.id().to_string(),
            attempt_no: attempt.attempt_no(),
            status: attempt.status().as_str(),
            started_at: attempt.started_at(),
            ended_at: attempt.ended_at(),
            executor: attempt.executor().map(str::to_string),
            model: metrics.model.clone(),
            tokens_in: metrics.tokens_in,
            tokens_out: metrics.tokens_out,
            cost: metrics.cost,
            latency_ms: attempt.latency_ms(),
            error_code: attempt.error_code().map(str::to_string),
            error_detail: attempt.error_detail().map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ArtifactResponse {
    pub id: String,
    pub kind: String,
    pub uri: Option<String>,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&TaskArtifact> for ArtifactResponse {
    fn from(artifact: &TaskArtifact) -> Self {
        Self {
            id: artifact.id().to_string(),
            kind: artifact.kind().to_string(),
            uri: artifact.uri().map(str::to_string),
            content: artifact.content().map(str::to_string),
            created_at: artifact.created_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(body: serde_json::Value) -> CreateTaskRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn legacy_type_field_fills_capability() {
        let req = request(json!({
            "domain_type": "Document-Processing",
            "type": "LLM_Generation",
            "task_execution_type": "async",
            "payload": {"doc": 1}
        }));
        let new_task = req
            .into_new_task(TenantId::parse("t").unwrap(), "k".into())
            .unwrap();
        assert_eq!(new_task.domain, DomainType::DocumentProcessing);
        assert_eq!(new_task.capability, CapabilityType::LlmGeneration);
        assert_eq!(new_task.payload, r#"{"doc":1}"#);
        assert_eq!(new_task.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn unknown_domain_names_the_field() {
        let req = request(json!({
            "domain_type": "astrology",
            "capability_type": "llm_generation",
            "task_execution_type": "async",
            "payload": {}
        }));
        let err = req
            .into_new_task(TenantId::parse("t").unwrap(), "k".into())
            .unwrap_err();
        assert_eq!(err.field(), Some("domain_type"));
    }

    #[test]
    fn list_params_reject_unknown_filters() {
        let params = ListTasksParams {
            status: Some("exploded".into()),
            ..ListTasksParams::default()
        };
        assert_eq!(params.into_query().unwrap_err().field(), Some("status"));

        let params = ListTasksParams {
            kind: Some("vision-ocr".into()),
            page: Some(2),
            ..ListTasksParams::default()
        };
        let query = params.into_query().unwrap();
        assert_eq!(query.capability, Some(CapabilityType::VisionOcr));
        assert_eq!(query.page, 2);
        assert_eq!(query.page_size, 20);
    }
}
