//! Durable task storage boundary.
//!
//! Tasks, attempts, artifacts and outbox entries live behind one trait so the
//! engine can run against Postgres in production and a lock-guarded map in
//! tests.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use r#trait::{
    InsertOutcome, ListQuery, Page, ReconcileOutcome, Reconciliation, StoreError, TaskStore,
};
