//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backend selection (store/queue) and background loops
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs and mapping to domain types
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    let tenant_scoped = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn(middleware::tenant_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(tenant_scoped)
        .layer(ServiceBuilder::new())
}
