//! Broker-backed [`TaskQueue`](taskforge_events::TaskQueue) implementations.
//!
//! The in-memory queue lives in `taskforge-events`; brokers that need extra
//! dependencies are feature-gated here.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsTaskQueue;
