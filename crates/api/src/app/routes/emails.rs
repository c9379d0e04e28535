use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use courier_core::{BrokerMessageId, JobId, ListQuery};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn list_emails(
    Extension(services): Extension<Arc<AppServices>>,
    params: Result<Query<dto::ListEmailsParams>, QueryRejection>,
) -> axum::response::Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return errors::bad_request(rejection),
    };

    let query = match ListQuery::parse(
        params.page,
        params.per_page,
        params.status.as_deref(),
        params.search.as_deref(),
        params.sort_by.as_deref(),
        params.sort_order.as_deref(),
    ) {
        Ok(q) => q,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.ledger.list(&query).await {
        Ok(page) => (StatusCode::OK, Json(page.map(dto::EmailJobResponse::from))).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn get_email(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.ledger.get(id).await {
        Ok(job) => (StatusCode::OK, Json(dto::EmailJobResponse::from(job))).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn get_email_by_message(
    Extension(services): Extension<Arc<AppServices>>,
    Path(message_id): Path<String>,
) -> axum::response::Response {
    let message_id = BrokerMessageId::new(message_id);
    match services.ledger.get_by_broker_message_id(&message_id).await {
        Ok(job) => (StatusCode::OK, Json(dto::EmailJobResponse::from(job))).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn retry_email(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.ledger.retry(id).await {
        Ok(receipt) => (
            StatusCode::OK,
            Json(dto::QueuedResponse {
                message: "Email queued for retry",
                job_id: receipt.broker_message_id,
                email_id: Some(receipt.job_id),
            }),
        )
            .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn delete_email(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.ledger.delete(id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(dto::DeletedResponse {
                message: "Email deleted successfully",
                id,
            }),
        )
            .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn stats_summary(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.ledger.stats().await {
        Ok(counts) => (StatusCode::OK, Json(dto::StatsResponse::from(counts))).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>().map_err(errors::domain_error_to_response)
}
