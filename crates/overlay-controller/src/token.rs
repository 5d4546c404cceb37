//! A configured-at-startup [`TokenValidator`]: a fixed table of
//! bearer tokens to the user id they authenticate as. Real identity
//! provider integration (OIDC/JWKS) needs an HTTP client this
//! workspace's dependency set doesn't otherwise carry, so this is the
//! default adapter wired into the controller binary; swapping in a
//! real validator only means implementing this same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use overlay_model::OverlayError;
use overlay_ports::TokenValidator;

pub struct StaticTokenValidator {
    tokens: HashMap<String, String>,
}

impl StaticTokenValidator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<String, OverlayError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| OverlayError::unauthenticated("access token not recognized"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn validates_configured_token() {
        let validator = StaticTokenValidator::new(HashMap::from([("tok-1".to_string(), "user-1".to_string())]));
        assert_eq!(validator.validate("tok-1").await.unwrap(), "user-1");
    }

    #[tokio::test]
    async fn rejects_unknown_token() {
        let validator = StaticTokenValidator::new(HashMap::new());
        assert!(validator.validate("nope").await.is_err());
    }
}
