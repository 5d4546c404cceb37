use async_trait::async_trait;
use overlay_model::OverlayError;

/// Validates a bearer access token against the identity provider and
/// returns the stable user id it belongs to. Caching, JWKS refresh,
/// and PKCE bootstrap are all the implementer's concern; the core
/// only ever asks "is this token good, and whose is it".
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<String, OverlayError>;
}
