use axum::Router;

pub mod system;
pub mod tasks;

/// Router for all versioned endpoints (tenant context required).
pub fn router() -> Router {
    Router::new().nest("/api/v1/tasks", tasks::router())
}
