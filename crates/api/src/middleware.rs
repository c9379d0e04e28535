use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use serde::Deserialize;

use courier_auth::{authorize, AuthError, JwtValidator, SharedSecret};

use crate::app::errors::auth_error_to_response;
use crate::context::PrincipalContext;

/// Header carrying the shared secret of machine senders.
pub const SECRET_KEY_HEADER: &str = "x-secret-key";

#[derive(Clone)]
pub struct AuthState {
    pub jwt: Arc<dyn JwtValidator>,
}

#[derive(Clone)]
pub struct SecretKeyState {
    pub secret: SharedSecret,
}

#[derive(Debug, Default, Deserialize)]
pub struct SecretKeyParams {
    secret_key: Option<String>,
}

/// Bearer authentication for the ledger and configuration routes.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let claims = match extract_bearer(req.headers()).and_then(|token| state.jwt.validate(token)) {
        Ok(claims) => claims,
        Err(err) => return auth_error_to_response(err),
    };

    let principal = match authorize(&claims) {
        Ok(principal) => principal,
        Err(err) => {
            tracing::debug!(user = %claims.sub, error = %err, "bearer token denied");
            return auth_error_to_response(err);
        }
    };

    req.extensions_mut().insert(PrincipalContext::new(principal));
    next.run(req).await
}

/// Shared-secret check for the send endpoint.
///
/// The key is read from the `x-secret-key` header, falling back to the
/// `secret_key` query parameter.
pub async fn secret_key_middleware(
    State(state): State<SecretKeyState>,
    params: Option<Query<SecretKeyParams>>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let from_query = params.and_then(|Query(p)| p.secret_key);
    let presented = req
        .headers()
        .get(SECRET_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(from_query);

    if let Err(err) = state.secret.verify(presented.as_deref()) {
        return auth_error_to_response(err);
    }

    next.run(req).await
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, AuthError> {
    let missing = || AuthError::unauthenticated("no token provided");

    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(missing)?;

    let header = header.to_str().map_err(|_| missing())?;

    let header = header.strip_prefix("Bearer ").ok_or_else(missing)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(missing());
    }

    Ok(token)
}
