//! Bearer token verification.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::{AuthError, JwtClaims};

/// Verifies a raw bearer token and returns its claims.
pub trait JwtValidator: Send + Sync + 'static {
    fn validate(&self, token: &str) -> Result<JwtClaims, AuthError>;
}

/// HMAC-SHA256 validator sharing a secret with the identity service.
pub struct Hs256JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256JwtValidator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }
}

impl core::fmt::Debug for Hs256JwtValidator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hs256JwtValidator").finish_non_exhaustive()
    }
}

impl JwtValidator for Hs256JwtValidator {
    fn validate(&self, token: &str) -> Result<JwtClaims, AuthError> {
        decode::<JwtClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::unauthenticated("token has expired"),
                _ => {
                    tracing::debug!(error = %e, "bearer token rejected");
                    AuthError::unauthenticated("invalid token")
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn mint(secret: &str, exp_offset: Duration) -> String {
        let claims = JwtClaims {
            sub: "ada".into(),
            user_id: None,
            email: None,
            is_active: true,
            approved: true,
            tools: vec!["email_service".into()],
            is_admin: false,
            exp: (Utc::now() + exp_offset).timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_round_trips() {
        let validator = Hs256JwtValidator::new("s3cret");
        let claims = validator.validate(&mint("s3cret", Duration::minutes(5))).unwrap();
        assert_eq!(claims.sub, "ada");
    }

    #[test]
    fn wrong_secret_and_expired_tokens_are_unauthenticated() {
        let validator = Hs256JwtValidator::new("s3cret");

        assert_eq!(
            validator.validate(&mint("other", Duration::minutes(5))),
            Err(AuthError::unauthenticated("invalid token"))
        );
        assert_eq!(
            validator.validate(&mint("s3cret", Duration::minutes(-10))),
            Err(AuthError::unauthenticated("token has expired"))
        );
        assert!(validator.validate("not-a-jwt").is_err());
    }
}
