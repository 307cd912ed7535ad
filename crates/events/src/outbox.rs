//! Transactional outbox entries.
//!
//! A notification is first written to the outbox in the same commit as the
//! task change that caused it, and only then published. If the process dies
//! between commit and publish, the relay finds the unprocessed entry and
//! publishes it later. Deferred notifications (scheduled tasks, retry
//! backoff) use the same path with `available_at` in the future.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskforge_core::TaskId;
use thiserror::Error;
use uuid::Uuid;

use crate::message::TaskQueued;

pub const TASK_QUEUED_EVENT: &str = "task.queued";
pub const EVENT_TYPE_MAX_LEN: usize = 120;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("unexpected outbox event type `{0}`")]
    UnknownEventType(String),

    #[error("malformed outbox payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    id: Uuid,
    task_id: Option<TaskId>,
    event_type: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Entry for a `task.queued` notification, publishable from `available_at`.
    pub fn task_queued(
        message: &TaskQueued,
        now: DateTime<Utc>,
        available_at: DateTime<Utc>,
    ) -> Result<Self, OutboxError> {
        Ok(Self {
            id: Uuid::now_v7(),
            task_id: Some(message.task_id),
            event_type: TASK_QUEUED_EVENT.to_string(),
            payload: serde_json::to_value(message)?,
            created_at: now,
            available_at: available_at.max(now),
            processed_at: None,
        })
    }

    pub fn from_parts(
        id: Uuid,
        task_id: Option<TaskId>,
        event_type: String,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
        available_at: DateTime<Utc>,
        processed_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            task_id,
            event_type,
            payload,
            created_at,
            available_at,
            processed_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn available_at(&self) -> DateTime<Utc> {
        self.available_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now
    }

    pub fn mark_processed(&mut self, now: DateTime<Utc>) {
        if self.processed_at.is_none() {
            self.processed_at = Some(now);
        }
    }

    /// Decode the notification carried by a `task.queued` entry.
    pub fn decode_task_queued(&self) -> Result<TaskQueued, OutboxError> {
        if self.event_type != TASK_QUEUED_EVENT {
            return Err(OutboxError::UnknownEventType(self.event_type.clone()));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
