//! Infrastructure layer: storage, queues, and the background machinery that
//! moves tasks through their lifecycle.
//!
//! - [`intake`]: validated, idempotent task creation and the read/cancel API
//! - [`engine`]: claim-and-execute for one notification
//! - [`worker`]: pool of engine-driving tokio tasks
//! - [`reaper`]: recovery of expired leases
//! - [`outbox`]: relay for notifications committed but not yet published

pub mod config;
pub mod engine;
pub mod intake;
pub mod outbox;
pub mod queue;
pub mod reaper;
pub mod store;
pub mod worker;

pub use config::{ConfigError, EngineConfig};
pub use engine::{ClaimExecuteEngine, EngineError, ProcessOutcome};
pub use intake::{Created, IntakeError, IntakeService};
pub use outbox::OutboxRelay;
pub use reaper::{LeaseReaper, SweepReport};
pub use store::{InMemoryTaskStore, ListQuery, Page, PostgresTaskStore, StoreError, TaskStore};
pub use worker::WorkerPool;

#[cfg(test)]
mod integration_tests;
