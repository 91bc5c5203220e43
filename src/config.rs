//! Server configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AlmanacError, Result};

/// Default per-call timeout. Health aggregates every dependency probe, the
/// slowest expected collaborator call, so this must stay comfortably above it.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Default JWKS refresh interval
pub const DEFAULT_KEY_REFRESH_SECS: u64 = 300;

/// MCP protocol version this server speaks by default
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Top-level server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name reported in the initialize handshake
    pub server_name: String,
    /// Per-capability call timeout
    pub call_timeout: Duration,
    /// OAuth resource-server settings (HTTP transport only)
    pub oauth: Option<OauthConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "almanac".to_string(),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            oauth: None,
        }
    }
}

/// Resource-server authorization settings.
///
/// The server only validates tokens; issuance belongs to the external
/// identity provider described by `discovery`.
#[derive(Debug, Clone)]
pub struct OauthConfig {
    /// This server's own published identifier. A token whose audience claim
    /// is anything else is rejected, even if otherwise well formed.
    pub resource_id: String,
    /// Issuers we accept tokens from
    pub allowed_issuers: Vec<String>,
    /// Where to fetch the issuer's signing keys
    pub jwks_url: String,
    /// Realm used in WWW-Authenticate challenges
    pub realm: String,
    /// Where rejected callers are pointed to obtain a token
    pub authorization_uri: String,
    /// How long a fetched key set stays fresh
    pub key_refresh: Duration,
    /// Identity-provider discovery document republished at
    /// /.well-known/oauth-authorization-server
    pub discovery: DiscoveryDocument,
}

impl OauthConfig {
    /// Validate the config at startup. Serving with an empty issuer list or
    /// audience would silently accept nothing or everything.
    pub fn validate(&self) -> Result<()> {
        if self.resource_id.is_empty() {
            return Err(AlmanacError::Config("resource_id must not be empty".into()));
        }
        if self.allowed_issuers.is_empty() {
            return Err(AlmanacError::Config(
                "at least one allowed issuer is required".into(),
            ));
        }
        if self.jwks_url.is_empty() {
            return Err(AlmanacError::Config("jwks_url must not be empty".into()));
        }
        Ok(())
    }
}

/// RFC 8414 authorization-server metadata, as republished to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub scopes_supported: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_oauth() -> OauthConfig {
        OauthConfig {
            resource_id: "https://mcp.almanac.example".to_string(),
            allowed_issuers: vec!["https://id.almanac.example".to_string()],
            jwks_url: "https://id.almanac.example/jwks".to_string(),
            realm: "almanac".to_string(),
            authorization_uri: "https://mcp.almanac.example/.well-known/oauth-authorization-server"
                .to_string(),
            key_refresh: Duration::from_secs(DEFAULT_KEY_REFRESH_SECS),
            discovery: DiscoveryDocument {
                issuer: "https://id.almanac.example".to_string(),
                authorization_endpoint: "https://id.almanac.example/authorize".to_string(),
                token_endpoint: "https://id.almanac.example/token".to_string(),
                jwks_uri: "https://id.almanac.example/jwks".to_string(),
                scopes_supported: vec!["kb.read".to_string(), "kb.search".to_string()],
            },
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(sample_oauth().validate().is_ok());
    }

    #[test]
    fn test_empty_issuers_rejected() {
        let mut cfg = sample_oauth();
        cfg.allowed_issuers.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_resource_id_rejected() {
        let mut cfg = sample_oauth();
        cfg.resource_id.clear();
        assert!(cfg.validate().is_err());
    }
}
