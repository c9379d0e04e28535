//! `courier-auth` — credential checks for the dispatch API.
//!
//! Two credentials exist: a shared secret for machine senders and a bearer
//! JWT for people using the ledger and configuration surface. This crate is
//! decoupled from HTTP; the API maps `AuthError` onto status codes.

pub mod authorize;
pub mod claims;
pub mod jwt;
pub mod principal;
pub mod secret;

pub use authorize::{authorize, require_admin, AuthError, EMAIL_SERVICE_TOOL};
pub use claims::JwtClaims;
pub use jwt::{Hs256JwtValidator, JwtValidator};
pub use principal::{Principal, PrincipalId};
pub use secret::SharedSecret;
