//! Shared-secret credential used by machine senders.

use crate::AuthError;

#[derive(Clone)]
pub struct SharedSecret(String);

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Check a presented key. Missing and mismatched keys are both forbidden.
    pub fn verify(&self, presented: Option<&str>) -> Result<(), AuthError> {
        match presented {
            Some(key) if !self.0.is_empty() && constant_time_eq(key.as_bytes(), self.0.as_bytes()) => Ok(()),
            _ => Err(AuthError::forbidden("invalid or missing secret key")),
        }
    }
}

impl core::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_exact_key_passes() {
        let secret = SharedSecret::new("k-123");
        assert!(secret.verify(Some("k-123")).is_ok());
        assert!(secret.verify(Some("k-124")).is_err());
        assert!(secret.verify(Some("k-12")).is_err());
        assert!(secret.verify(None).is_err());
    }

    #[test]
    fn empty_configured_secret_never_matches() {
        assert!(SharedSecret::new("").verify(Some("")).is_err());
    }
}
