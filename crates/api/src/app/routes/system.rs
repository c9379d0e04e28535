use axum::{extract::Extension, response::IntoResponse, Json};
use serde_json::json;

use crate::context::PrincipalContext;

/// Liveness probe; no credentials required.
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "email-service" }))
}

pub async fn whoami(Extension(principal): Extension<PrincipalContext>) -> impl IntoResponse {
    Json(principal.principal().clone())
}
