//! `taskforge-events`: messaging contracts.
//!
//! Transport-agnostic pieces shared by producers and consumers of task
//! notifications: the `TaskQueued` message, the `TaskQueue` trait with an
//! in-memory implementation, and outbox entries.
//!
//! Broker-backed queues live in `taskforge-infra`.

pub mod in_memory_queue;
pub mod message;
pub mod outbox;
pub mod queue;

pub use in_memory_queue::InMemoryTaskQueue;
pub use message::TaskQueued;
pub use outbox::{OutboxError, OutboxMessage, TASK_QUEUED_EVENT};
pub use queue::{Delivery, QueueError, TaskQueue};
