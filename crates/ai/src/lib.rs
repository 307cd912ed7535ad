//! `taskforge-ai`
//!
//! **Responsibility:** the executor boundary.
//!
//! This crate knows how to *run* a task, never how to *store* one:
//! - Executors receive capability + payload and return output or an error.
//! - They must not touch task state; the engine records what they report.
//! - The registry maps each domain to exactly one executor.

pub mod executor;
pub mod registry;
pub mod result;
pub mod simulated;

pub use executor::TaskExecutor;
pub use registry::ExecutorRegistry;
pub use result::{ConfigurationError, ExecutionError, ExecutionOutput};
pub use simulated::SimulatedExecutor;
