//! Durable outputs of successful executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ArtifactId, TaskId};

pub const ARTIFACT_KIND_TEXT: &str = "text";
pub const ARTIFACT_KIND_MAX_LEN: usize = 40;

/// An immutable output attached to a task.
///
/// Holds either inline `content` or a `uri` pointing at external storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskArtifact {
    id: ArtifactId,
    task_id: TaskId,
    kind: String,
    uri: Option<String>,
    content: Option<String>,
    created_at: DateTime<Utc>,
}

impl TaskArtifact {
    /// Inline text result.
    pub fn text(task_id: TaskId, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: ArtifactId::new(),
            task_id,
            kind: ARTIFACT_KIND_TEXT.to_string(),
            uri: None,
            content: Some(content.into()),
            created_at: now,
        }
    }

    /// Output stored elsewhere and referenced by URI.
    pub fn reference(
        task_id: TaskId,
        kind: impl Into<String>,
        uri: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let kind = kind.into();
        if kind.trim().is_empty() || kind.chars().count() > ARTIFACT_KIND_MAX_LEN {
            return Err(DomainError::validation(
                "kind",
                format!("artifact kind must be 1..={ARTIFACT_KIND_MAX_LEN} characters"),
            ));
        }
        let uri = uri.into();
        if uri.trim().is_empty() {
            return Err(DomainError::validation("uri", "artifact uri is required"));
        }
        Ok(Self {
            id: ArtifactId::new(),
            task_id,
            kind,
            uri: Some(uri),
            content: None,
            created_at: now,
        })
    }

    pub fn from_parts(
        id: ArtifactId,
        task_id: TaskId,
        kind: String,
        uri: Option<String>,
        content: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id,
            kind,
            uri,
            content,
            created_at,
        }
    }

    pub fn id(&self) -> ArtifactId {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
