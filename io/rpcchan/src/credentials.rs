//! Per-RPC credentials.

use crate::metadata::Metadata;
use crate::status::Status;

use async_trait::async_trait;

/// Credentials attached to individual calls as request metadata.
#[async_trait]
pub trait PerRpcCredentials: Send + Sync {
    /// Metadata to add to a call made to `uri`.
    async fn request_metadata(&self, uri: &str) -> Result<Metadata, Status>;

    /// Whether these credentials may only be sent over a secure transport.
    fn require_transport_security(&self) -> bool;
}

/// Sends a fixed `authorization: Bearer <token>` header.
#[derive(Clone)]
pub struct BearerToken {
    token: String,
    require_security: bool,
}

impl BearerToken {
    /// Create bearer credentials that require a secure transport.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            require_security: true,
        }
    }

    /// Allow the token to be sent over plaintext connections.
    pub fn allow_insecure(mut self) -> Self {
        self.require_security = false;
        self
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken")
            .field("token", &"<redacted>")
            .field("require_security", &self.require_security)
            .finish()
    }
}

#[async_trait]
impl PerRpcCredentials for BearerToken {
    async fn request_metadata(&self, _uri: &str) -> Result<Metadata, Status> {
        let mut md = Metadata::new();
        md.insert("authorization", format!("Bearer {}", self.token));
        Ok(md)
    }

    fn require_transport_security(&self) -> bool {
        self.require_security
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bearer_token_metadata() {
        let creds = BearerToken::new("s3cret");
        let md = creds.request_metadata("http://localhost/").await.unwrap();
        assert_eq!(md.get("authorization"), Some("Bearer s3cret"));
        assert!(creds.require_transport_security());
    }

    #[test]
    fn test_bearer_token_allow_insecure() {
        let creds = BearerToken::new("t").allow_insecure();
        assert!(!creds.require_transport_security());
    }

    #[test]
    fn test_bearer_token_debug_redacts() {
        let debug = format!("{:?}", BearerToken::new("s3cret"));
        assert!(!debug.contains("s3cret"));
    }
}
