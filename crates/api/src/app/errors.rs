use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use courier_auth::AuthError;
use courier_core::DomainError;
use courier_infra::dispatch::DispatchError;
use courier_infra::scheduler::SchedulerError;

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DispatchError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        DispatchError::InvalidState(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_state", msg),
        DispatchError::Broker(e) => {
            tracing::error!(error = %e, "broker request failed");
            json_error(StatusCode::BAD_GATEWAY, "broker_error", e.to_string())
        }
        DispatchError::Store(e) => {
            tracing::error!(error = %e, "record store request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    dispatch_error_to_response(err.into())
}

pub fn auth_error_to_response(err: AuthError) -> axum::response::Response {
    match err {
        AuthError::Unauthenticated(msg) => json_error(StatusCode::UNAUTHORIZED, "unauthorized", msg),
        AuthError::Forbidden(msg) => json_error(StatusCode::FORBIDDEN, "forbidden", msg),
    }
}

pub fn scheduler_error_to_response(err: SchedulerError) -> axum::response::Response {
    tracing::error!(error = %err, "manual cleanup failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "cleanup_failed", err.to_string())
}

/// Rejection of a malformed body or query string.
pub fn bad_request(rejection: impl std::fmt::Display) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "bad_request", rejection.to_string())
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
