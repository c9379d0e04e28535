use axum::{
    routing::{get, post},
    Router,
};

pub mod config;
pub mod emails;
pub mod send;
pub mod system;

/// Router for all bearer-authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/api/whoami", get(system::whoami))
        .route("/api/emails", get(emails::list_emails))
        .route("/api/emails/stats/summary", get(emails::stats_summary))
        .route("/api/emails/by-message/:message_id", get(emails::get_email_by_message))
        .route("/api/emails/:id", get(emails::get_email).delete(emails::delete_email))
        .route("/api/emails/:id/retry", post(emails::retry_email))
        .route("/api/config", get(config::get_config).put(config::update_config))
        .route("/api/config/cleanup", post(config::cleanup))
}
