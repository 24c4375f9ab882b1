use regex::Regex;
use std::sync::LazyLock;

use crate::error::ApiError;

/// IPv4, IPv6 and opaque identifiers such as API key fingerprints.
static CLIENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9:._\-]{1,128}$").expect("client id pattern is valid"));

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Validates a client identifier used as a bucket key.
    pub fn validate_client_id(client_id: &str) -> Result<(), ApiError> {
        if client_id.trim().is_empty() {
            return Err(ApiError::InvalidRequest(
                "Client id cannot be empty".to_string(),
            ));
        }

        if client_id == crate::admission::GLOBAL_KEY {
            return Err(ApiError::InvalidRequest(
                "Client id 'global' is reserved".to_string(),
            ));
        }

        if !CLIENT_ID.is_match(client_id) {
            return Err(ApiError::InvalidRequest(
                "Client id may only contain letters, digits, ':', '.', '_' and '-' (max 128)"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
