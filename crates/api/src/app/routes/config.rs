use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use courier_auth::require_admin;
use courier_core::RetentionUpdate;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub async fn get_config(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.ledger.retention_config().await {
        Ok(config) => (StatusCode::OK, Json(dto::RetentionConfigResponse::from(config))).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn update_config(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    body: Result<Json<dto::UpdateConfigRequest>, JsonRejection>,
) -> axum::response::Response {
    if let Err(e) = require_admin(principal.principal()) {
        return errors::auth_error_to_response(e);
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::bad_request(rejection),
    };

    let update = match RetentionUpdate::new(
        body.auto_delete_enabled,
        body.delete_after_days,
        body.delete_cycle.as_deref(),
    ) {
        Ok(update) => update,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.ledger.update_retention_config(&update).await {
        Ok(config) => {
            tracing::info!(user = %principal.username(), "retention configuration changed");
            (
                StatusCode::OK,
                Json(dto::ConfigUpdatedResponse {
                    message: "Configuration updated successfully",
                    config: config.into(),
                }),
            )
                .into_response()
        }
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// Purge expired records now, whatever the schedule says.
pub async fn cleanup(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(e) = require_admin(principal.principal()) {
        return errors::auth_error_to_response(e);
    }

    match services.scheduler.purge_now().await {
        Ok(report) => {
            tracing::info!(user = %principal.username(), deleted = report.deleted, "manual cleanup finished");
            (
                StatusCode::OK,
                Json(dto::CleanupResponse {
                    message: "Cleanup completed successfully",
                    deleted_count: report.deleted,
                    delete_after_days: report.delete_after_days,
                }),
            )
                .into_response()
        }
        Err(e) => errors::scheduler_error_to_response(e),
    }
}
