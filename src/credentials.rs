//! Seam to the credential-at-rest store.
//!
//! The store itself is an external collaborator; the bridge only needs
//! `get(key) -> secret`. The default implementation resolves keys from the
//! process environment, which is also what `${env:NAME}` substitution uses.

use crate::error::CredentialError;

/// Read-only secret lookup. Implementations decrypt on demand.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<String, CredentialError>;
}

/// Resolves credential keys directly from environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn get(&self, key: &str) -> Result<String, CredentialError> {
        std::env::var(key).map_err(|_| CredentialError::Missing(key.to_string()))
    }
}

/// Loggable preview of a secret: `first6…last4`, never the full value.
pub fn secret_preview(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() < 12 {
        return "***".to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_shows_head_and_tail_only() {
        let p = secret_preview("dapiABCDEFGHIJKLMNOP1234");
        assert_eq!(p, "dapiAB…1234");
        assert!(!p.contains("CDEFGH"));
    }

    #[test]
    fn preview_masks_short_secrets_entirely() {
        assert_eq!(secret_preview("hunter2"), "***");
        assert_eq!(secret_preview(""), "***");
    }

    #[test]
    fn env_store_reports_missing_keys() {
        let store = EnvCredentialStore;
        let err = store.get("ZEROBRIDGE_TEST_DOES_NOT_EXIST").unwrap_err();
        assert!(err.to_string().contains("ZEROBRIDGE_TEST_DOES_NOT_EXIST"));
    }
}
