//! Work queue abstraction (mechanics only).
//!
//! The queue carries [`TaskQueued`] notifications from producers (intake,
//! engine retries, the outbox relay, the lease reaper) to competing workers.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a message may be delivered more than once, and a
//!   delivery that is never acknowledged may be delivered again.
//! - **Unordered**: no ordering across tasks.
//! - **Competing consumers**: each delivery goes to one consumer.
//!
//! Consumers must be idempotent; for tasks that is what the lease claim
//! guarantees.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::message::TaskQueued;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was shut down; no further deliveries.
    #[error("queue closed")]
    Closed,

    #[error("message serialization failed: {0}")]
    Serialization(String),

    /// Broker/network failure.
    #[error("queue transport error: {0}")]
    Transport(String),
}

/// A message handed to one consumer.
///
/// `receipt` is the transport's handle for acknowledging it (e.g. a stream
/// entry id); transports without explicit acks leave it empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: TaskQueued,
    pub receipt: Option<String>,
}

impl Delivery {
    pub fn new(message: TaskQueued) -> Self {
        Self {
            message,
            receipt: None,
        }
    }

    pub fn with_receipt(message: TaskQueued, receipt: impl Into<String>) -> Self {
        Self {
            message,
            receipt: Some(receipt.into()),
        }
    }
}

#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    async fn publish(&self, message: TaskQueued) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next delivery. `Ok(None)` on timeout.
    async fn receive(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Confirm a delivery was handled; it will not be redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

#[async_trait::async_trait]
impl<Q> TaskQueue for Arc<Q>
where
    Q: TaskQueue + ?Sized,
{
    async fn publish(&self, message: TaskQueued) -> Result<(), QueueError> {
        (**self).publish(message).await
    }

    async fn receive(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        (**self).receive(consumer, wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(delivery).await
    }
}
