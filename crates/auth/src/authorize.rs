use thiserror::Error;

use crate::{JwtClaims, Principal};

/// Tool grant required to use the email ledger.
pub const EMAIL_SERVICE_TOOL: &str = "email_service";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No credential, or one that could not be verified.
    #[error("unauthorized: {0}")]
    Unauthenticated(String),

    /// A verified credential without the required standing or grant.
    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl AuthError {
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }
}

/// Turn verified claims into a principal.
///
/// The account must be active and approved and must hold the
/// `email_service` tool.
///
/// - No IO
/// - No panics
pub fn authorize(claims: &JwtClaims) -> Result<Principal, AuthError> {
    if !claims.is_active {
        return Err(AuthError::forbidden("user account is inactive"));
    }
    if !claims.approved {
        return Err(AuthError::forbidden("user account is not approved"));
    }
    if !claims.has_tool(EMAIL_SERVICE_TOOL) {
        return Err(AuthError::forbidden(format!(
            "you need '{EMAIL_SERVICE_TOOL}' tool access, please contact an administrator"
        )));
    }

    Ok(Principal {
        id: claims.user_id.clone(),
        username: claims.sub.clone(),
        email: claims.email.clone(),
        is_admin: claims.is_admin,
        tools: claims.tools.clone(),
    })
}

pub fn require_admin(principal: &Principal) -> Result<(), AuthError> {
    if principal.is_admin {
        Ok(())
    } else {
        Err(AuthError::forbidden("admin privileges required"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> JwtClaims {
        JwtClaims {
            sub: "ada".into(),
            user_id: None,
            email: Some("ada@example.com".into()),
            is_active: true,
            approved: true,
            tools: vec![EMAIL_SERVICE_TOOL.into()],
            is_admin: false,
            exp: 0,
        }
    }

    #[test]
    fn active_approved_tool_holder_is_authorized() {
        let principal = authorize(&claims()).unwrap();
        assert_eq!(principal.username, "ada");
        assert!(!principal.is_admin);
        assert!(require_admin(&principal).is_err());
    }

    #[test]
    fn each_missing_standing_is_forbidden() {
        let mut inactive = claims();
        inactive.is_active = false;
        let mut unapproved = claims();
        unapproved.approved = false;
        let mut no_tool = claims();
        no_tool.tools = vec!["crm".into()];

        for c in [inactive, unapproved, no_tool] {
            assert!(matches!(authorize(&c), Err(AuthError::Forbidden(_))));
        }
    }

    #[test]
    fn admin_flag_passes_admin_check() {
        let mut c = claims();
        c.is_admin = true;
        let principal = authorize(&c).unwrap();
        assert!(require_admin(&principal).is_ok());
    }
}
