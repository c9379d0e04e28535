use serde::{Deserialize, Serialize};

/// Identity of an authenticated user as issued by the identity service.
///
/// Upstream issuers use either numeric or string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrincipalId {
    Numeric(i64),
    Text(String),
}

impl core::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PrincipalId::Numeric(n) => write!(f, "{n}"),
            PrincipalId::Text(s) => f.write_str(s),
        }
    }
}

/// An authenticated, authorized caller of the ledger surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: Option<PrincipalId>,
    pub username: String,
    pub email: Option<String>,
    pub is_admin: bool,
    pub tools: Vec<String>,
}
