use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use taskforge_core::DomainError;
use taskforge_infra::IntakeError;

pub fn intake_error_to_response(err: IntakeError) -> axum::response::Response {
    match err {
        IntakeError::Validation(e) => domain_error_to_response(e),
        IntakeError::NotFound(_) => not_found(),
        IntakeError::Rejected { .. } => json_error(StatusCode::CONFLICT, "cancel_rejected", err.to_string()),
        IntakeError::Store(e) => {
            tracing::error!(error = %e, "store failure while serving request");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        IntakeError::Outbox(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "outbox_error", e.to_string())
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation { field, message } => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "error": "validation_error",
                "message": message,
                "field": field,
            })),
        )
            .into_response(),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::InvalidTransition(msg) => json_error(StatusCode::CONFLICT, "invalid_transition", msg),
    }
}

pub fn not_found() -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", "Task not found.")
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
