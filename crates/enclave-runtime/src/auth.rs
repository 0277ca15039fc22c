//! Credential validation.
//!
//! Credentials are never compared as strings. Both the presented credential and
//! every configured secret are reduced to SHA-256 digests, and the digests are
//! compared without early exit so the time taken does not depend on where (or
//! whether) they differ.

use crate::config::AuthConfig;
use crate::error::AuthError;
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 digest of a credential.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialHash([u8; 32]);

impl CredentialHash {
    pub fn of(credential: &str) -> Self {
        let digest = Sha256::digest(credential.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    fn constant_time_eq(&self, other: &CredentialHash) -> bool {
        let diff = self
            .0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        std::hint::black_box(diff) == 0
    }
}

impl fmt::Debug for CredentialHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialHash({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Stateless validator over the configured secrets.
pub struct AuthValidator {
    secrets: Vec<CredentialHash>,
}

impl AuthValidator {
    pub fn new<S: AsRef<str>>(secrets: impl IntoIterator<Item = S>) -> Self {
        Self {
            secrets: secrets
                .into_iter()
                .map(|s| CredentialHash::of(s.as_ref()))
                .collect(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.secrets.iter().map(|s| s.expose()))
    }

    /// Checks `credential` against every configured secret.
    ///
    /// All secrets are compared even after a match.
    pub fn validate(&self, credential: &str) -> Result<CredentialHash, AuthError> {
        if self.secrets.is_empty() {
            return Err(AuthError::NoSecretConfigured);
        }
        if credential.is_empty() {
            return Err(AuthError::EmptyCredential);
        }

        let presented = CredentialHash::of(credential);
        let matched = self
            .secrets
            .iter()
            .fold(false, |acc, secret| acc | secret.constant_time_eq(&presented));

        if matched {
            Ok(presented)
        } else {
            Err(AuthError::InvalidCredential)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;

    #[test]
    fn accepts_configured_secret() {
        let validator = AuthValidator::new(["tok-A"]);
        let hash = validator.validate("tok-A").unwrap();
        assert_eq!(hash, CredentialHash::of("tok-A"));
    }

    #[test]
    fn rejects_other_credentials() {
        let validator = AuthValidator::new(["tok-A"]);
        assert!(matches!(
            validator.validate("tok-B"),
            Err(AuthError::InvalidCredential)
        ));
        assert!(matches!(
            validator.validate("tok-A "),
            Err(AuthError::InvalidCredential)
        ));
    }

    #[test]
    fn any_of_several_secrets_authenticates() {
        let config = AuthConfig {
            secrets: vec![Secret::new("old"), Secret::new("new")],
        };
        let validator = AuthValidator::from_config(&config);
        assert!(validator.validate("old").is_ok());
        assert!(validator.validate("new").is_ok());
        assert!(validator.validate("other").is_err());
    }

    #[test]
    fn empty_inputs_are_rejected() {
        assert!(matches!(
            AuthValidator::new(Vec::<String>::new()).validate("tok-A"),
            Err(AuthError::NoSecretConfigured)
        ));
        assert!(matches!(
            AuthValidator::new(["tok-A"]).validate(""),
            Err(AuthError::EmptyCredential)
        ));
    }

    #[test]
    fn debug_output_does_not_leak_the_digest() {
        let printed = format!("{:?}", CredentialHash::of("tok-A"));
        assert!(printed.starts_with("CredentialHash("));
        assert!(printed.len() < 24);
    }
}
