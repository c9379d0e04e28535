use serde::{Deserialize, Serialize};

use crate::PrincipalId;

/// Claims carried by bearer tokens issued by the identity service.
///
/// Flags default to `false` and `tools` to empty, so a token that omits them
/// is denied rather than rejected as malformed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Username.
    pub sub: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<PrincipalId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default)]
    pub is_active: bool,

    #[serde(default)]
    pub approved: bool,

    /// Tools the account may use (e.g. `email_service`).
    #[serde(default)]
    pub tools: Vec<String>,

    #[serde(default)]
    pub is_admin: bool,

    /// Expiration, seconds since the epoch.
    pub exp: i64,
}

impl JwtClaims {
    pub fn has_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_flags_default_to_denied() {
        let claims: JwtClaims = serde_json::from_value(serde_json::json!({
            "sub": "ada",
            "exp": 0
        }))
        .unwrap();

        assert!(!claims.is_active);
        assert!(!claims.approved);
        assert!(!claims.is_admin);
        assert!(!claims.has_tool("email_service"));
    }

    #[test]
    fn numeric_and_textual_user_ids_are_accepted() {
        let numeric: JwtClaims =
            serde_json::from_value(serde_json::json!({"sub": "a", "exp": 0, "user_id": 12})).unwrap();
        let textual: JwtClaims =
            serde_json::from_value(serde_json::json!({"sub": "a", "exp": 0, "user_id": "u-12"})).unwrap();

        assert_eq!(numeric.user_id, Some(PrincipalId::Numeric(12)));
        assert_eq!(textual.user_id, Some(PrincipalId::Text("u-12".into())));
    }
}
