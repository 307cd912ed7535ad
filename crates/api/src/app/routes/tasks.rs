use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Extension, Path, Query},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use taskforge_core::TaskId;

use crate::app::dto::{
    ArtifactResponse, AttemptResponse, CreateTaskRequest, ListTasksParams, TaskPageResponse,
    TaskResponse,
};
use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_task).get(list_tasks))
        .route("/:id", get(get_task))
        .route("/:id/cancel", post(cancel_task))
        .route("/:id/attempts", get(list_attempts))
        .route("/:id/artifacts", get(list_artifacts))
}

fn parse_id(raw: &str) -> Result<TaskId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid task id"))
}

fn location(id: TaskId) -> [(header::HeaderName, String); 1] {
    [(header::LOCATION, format!("/api/v1/tasks/{id}"))]
}

pub async fn create_task(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    headers: HeaderMap,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text());
        }
    };

    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let new_task = match body.into_new_task(tenant.into_tenant_id(), idempotency_key) {
        Ok(t) => t,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.intake.create(new_task).await {
        Ok(created) => (
            StatusCode::ACCEPTED,
            location(created.task.id()),
            Json(TaskResponse::from(&created.task)),
        )
            .into_response(),
        Err(e) => errors::intake_error_to_response(e),
    }
}

pub async fn get_task(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.intake.get(id).await {
        Ok(Some(task)) => Json(TaskResponse::from(&task)).into_response(),
        Ok(None) => errors::not_found(),
        Err(e) => errors::intake_error_to_response(e),
    }
}

pub async fn list_tasks(
    Extension(services): Extension<Arc<AppServices>>,
    params: Result<Query<ListTasksParams>, QueryRejection>,
) -> axum::response::Response {
    let Query(params) = match params {
        Ok(p) => p,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_query", rejection.body_text());
        }
    };
    let query = match params.into_query() {
        Ok(q) => q,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let page = match services.intake.list(&query).await {
        Ok(page) => page,
        Err(e) => return errors::intake_error_to_response(e),
    };

    let mut headers = HeaderMap::new();
    if let Ok(total) = HeaderValue::from_str(&page.total_count.to_string()) {
        headers.insert("x-total-count", total);
    }
    let body = TaskPageResponse {
        items: page.items.iter().map(TaskResponse::from).collect(),
        total_count: page.total_count,
        page: query.page,
        page_size: query.page_size,
    };
    (StatusCode::OK, headers, Json(body)).into_response()
}

pub async fn cancel_task(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.intake.cancel(id).await {
        Ok(Some(task)) => (StatusCode::ACCEPTED, location(id), Json(TaskResponse::from(&task))).into_response(),
        Ok(None) => errors::not_found(),
        Err(e) => errors::intake_error_to_response(e),
    }
}

pub async fn list_attempts(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.intake.list_attempts(id).await {
        Ok(attempts) => Json(attempts.iter().map(AttemptResponse::from).collect::<Vec<_>>()).into_response(),
        Err(e) => errors::intake_error_to_response(e),
    }
}

pub async fn list_artifacts(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.intake.list_artifacts(id).await {
        Ok(artifacts) => Json(artifacts.iter().map(ArtifactResponse::from).collect::<Vec<_>>()).into_response(),
        Err(e) => errors::intake_error_to_response(e),
    }
}
