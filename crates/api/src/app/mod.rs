//! HTTP API application wiring (Axum router + service wiring).
//!
//! Layout:
//! - `services.rs`: adapter selection and service construction
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use tower::ServiceBuilder;

use courier_auth::{Hs256JwtValidator, SharedSecret};

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{build_services, AppServices};

/// Credentials the router checks.
#[derive(Clone)]
pub struct AuthConfig {
    /// HMAC secret for bearer tokens.
    pub jwt_secret: String,
    /// Shared secret for the send endpoint.
    pub secret_key: String,
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>, auth: AuthConfig) -> Router {
    let jwt = Arc::new(Hs256JwtValidator::new(auth.jwt_secret.into_bytes()));
    let auth_state = middleware::AuthState { jwt };
    let secret_state = middleware::SecretKeyState {
        secret: SharedSecret::new(auth.secret_key),
    };

    let sender = Router::new()
        .route("/api/send-email", post(routes::send::send_email))
        .layer(axum::middleware::from_fn_with_state(
            secret_state,
            middleware::secret_key_middleware,
        ));

    // Ledger and configuration routes: bearer token with tool access.
    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/api/health", get(routes::system::health))
        .merge(sender)
        .merge(protected)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
