use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Accept an email for asynchronous delivery.
pub async fn send_email(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::SendEmailRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::bad_request(rejection),
    };

    let submitted = services
        .gateway
        .submit(
            body.to.as_deref().unwrap_or_default(),
            body.subject.as_deref().unwrap_or_default(),
            body.html,
            body.text,
        )
        .await;

    match submitted {
        Ok(submission) => (
            StatusCode::ACCEPTED,
            Json(dto::QueuedResponse {
                message: "Email queued",
                job_id: submission.broker_message_id,
                email_id: submission.job_id,
            }),
        )
            .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
