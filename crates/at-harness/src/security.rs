//! Worker API key comparison and startup environment validation (spec §4.11).

use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("{0} must be at least {1} characters")]
    TooShort(String, usize),
}

// ===========================================================================
// ApiKeyValidator — constant-time worker API key check
// ===========================================================================

/// Compares a presented `Bearer <token>` against the configured worker API
/// key using constant-time equality, so response timing can't leak how many
/// leading bytes matched.
#[derive(Debug, Clone)]
pub struct ApiKeyValidator {
    expected: Vec<u8>,
}

impl ApiKeyValidator {
    pub fn new(expected_key: impl Into<String>) -> Self {
        Self {
            expected: expected_key.into().into_bytes(),
        }
    }

    /// Validate a raw `Authorization` header value of the form `Bearer <key>`.
    pub fn validate_header(&self, header_value: &str) -> Result<(), SecurityError> {
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or(SecurityError::InvalidApiKey)?;
        self.validate(token)
    }

    pub fn validate(&self, presented: &str) -> Result<(), SecurityError> {
        let presented = presented.as_bytes();
        // ConstantTimeEq requires equal-length slices to stay constant-time;
        // a length mismatch is itself safe to branch on (it's public information).
        if presented.len() != self.expected.len() {
            warn!("worker api key rejected: length mismatch");
            return Err(SecurityError::InvalidApiKey);
        }
        if presented.ct_eq(&self.expected).unwrap_u8() == 1 {
            Ok(())
        } else {
            warn!("worker api key rejected: mismatch");
            Err(SecurityError::InvalidApiKey)
        }
    }
}

// ===========================================================================
// Startup environment validation
// ===========================================================================

/// A single required environment variable and its minimum length, if any.
pub struct RequiredVar {
    pub name: &'static str,
    pub min_length: Option<usize>,
}

/// The spec's §6 fixed set: webhook secret, cron secret, worker API key,
/// session-hash salt (which additionally must be ≥32 chars).
pub fn required_vars() -> Vec<RequiredVar> {
    vec![
        RequiredVar { name: "WEBHOOK_SECRET", min_length: None },
        RequiredVar { name: "CRON_SECRET", min_length: None },
        RequiredVar { name: "WORKER_API_KEY", min_length: None },
        RequiredVar { name: "SESSION_HASH_SALT", min_length: Some(32) },
    ]
}

/// Validate that the required environment variables are present (and, for
/// `SESSION_HASH_SALT`, long enough). In production this is fatal (`Err`);
/// callers in development should log the same violations as warnings
/// instead of calling this at all, per spec §4.11.
pub fn validate_environment(getenv: impl Fn(&str) -> Option<String>) -> Result<(), Vec<SecurityError>> {
    let mut errors = Vec::new();
    for var in required_vars() {
        match getenv(var.name) {
            None => errors.push(SecurityError::MissingEnvVar(var.name.to_string())),
            Some(value) => {
                if let Some(min_len) = var.min_length {
                    if value.len() < min_len {
                        errors.push(SecurityError::TooShort(var.name.to_string(), min_len));
                    }
                }
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn constant_time_validator_accepts_matching_key() {
        let v = ApiKeyValidator::new("super-secret-worker-key");
        assert!(v.validate("super-secret-worker-key").is_ok());
    }

    #[test]
    fn constant_time_validator_rejects_mismatch() {
        let v = ApiKeyValidator::new("super-secret-worker-key");
        assert!(v.validate("wrong-key").is_err());
        assert!(v.validate("").is_err());
    }

    #[test]
    fn validate_header_strips_bearer_prefix() {
        let v = ApiKeyValidator::new("abc123");
        assert!(v.validate_header("Bearer abc123").is_ok());
        assert!(v.validate_header("abc123").is_err());
    }

    #[test]
    fn environment_validation_flags_missing_and_short_salt() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("WEBHOOK_SECRET", "a"),
            ("CRON_SECRET", "b"),
            ("WORKER_API_KEY", "c"),
            ("SESSION_HASH_SALT", "too-short"),
        ]);
        let errors = validate_environment(|k| env.get(k).map(|v| v.to_string())).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], SecurityError::TooShort(_, 32)));
    }

    #[test]
    fn environment_validation_passes_with_all_vars_set() {
        let salt = "x".repeat(32);
        let env: HashMap<&str, String> = HashMap::from([
            ("WEBHOOK_SECRET", "a".to_string()),
            ("CRON_SECRET", "b".to_string()),
            ("WORKER_API_KEY", "c".to_string()),
            ("SESSION_HASH_SALT", salt),
        ]);
        assert!(validate_environment(|k| env.get(k).cloned()).is_ok());
    }
}
