//! Almanac MCP server
//!
//! Run with: almanac-server            (stdio transport)
//!           almanac-server --http ... (streamable HTTP with OAuth)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use almanac::auth::{Authenticator, KeyStore};
use almanac::config::{
    DiscoveryDocument, OauthConfig, ServerConfig, DEFAULT_CALL_TIMEOUT_MS, DEFAULT_KEY_REFRESH_SECS,
};
use almanac::dispatch::{AuditTrail, Dispatcher};
use almanac::providers::{AnalyticsProvider, HealthProvider, SearchProvider};
use almanac::registry::{CapabilityProvider, CapabilityRegistry};
use almanac::transport::{
    http::{HttpServer, HttpState},
    StdioServer,
};

#[derive(Parser, Debug)]
#[command(name = "almanac-server")]
#[command(about = "Almanac MCP server - knowledge-base control plane")]
#[command(version)]
struct Args {
    /// Server name reported in the initialize handshake
    #[arg(long, env = "ALMANAC_SERVER_NAME", default_value = "almanac")]
    server_name: String,

    /// Per-capability call timeout in milliseconds
    #[arg(long, env = "ALMANAC_CALL_TIMEOUT_MS", default_value_t = DEFAULT_CALL_TIMEOUT_MS)]
    call_timeout_ms: u64,

    /// Serve streamable HTTP on this address instead of stdio
    #[arg(long, env = "ALMANAC_HTTP_ADDR")]
    http: Option<SocketAddr>,

    /// This server's own identifier; the required token audience
    #[arg(long, env = "ALMANAC_OAUTH_RESOURCE_ID")]
    oauth_resource_id: Option<String>,

    /// Trusted token issuer (repeatable)
    #[arg(long = "oauth-issuer", env = "ALMANAC_OAUTH_ISSUER", value_delimiter = ',')]
    oauth_issuers: Vec<String>,

    /// Issuer JWKS endpoint for signature verification
    #[arg(long, env = "ALMANAC_OAUTH_JWKS_URL")]
    oauth_jwks_url: Option<String>,

    /// Issuer authorization endpoint, republished in the discovery document
    #[arg(long, env = "ALMANAC_OAUTH_AUTHORIZE_ENDPOINT")]
    oauth_authorize_endpoint: Option<String>,

    /// Issuer token endpoint, republished in the discovery document
    #[arg(long, env = "ALMANAC_OAUTH_TOKEN_ENDPOINT")]
    oauth_token_endpoint: Option<String>,

    /// Realm used in WWW-Authenticate challenges
    #[arg(long, env = "ALMANAC_OAUTH_REALM", default_value = "almanac")]
    oauth_realm: String,

    /// JWKS refresh interval in seconds
    #[arg(long, env = "ALMANAC_KEY_REFRESH_SECS", default_value_t = DEFAULT_KEY_REFRESH_SECS)]
    key_refresh_secs: u64,
}

impl Args {
    /// OAuth config is all-or-nothing: the HTTP transport either runs with
    /// the full authorization layer or (for local development) without one.
    fn oauth_config(&self) -> anyhow::Result<Option<OauthConfig>> {
        let (Some(resource_id), Some(jwks_url)) =
            (&self.oauth_resource_id, &self.oauth_jwks_url)
        else {
            if self.oauth_resource_id.is_some() || self.oauth_jwks_url.is_some() {
                anyhow::bail!(
                    "--oauth-resource-id and --oauth-jwks-url must be provided together"
                );
            }
            return Ok(None);
        };
        let issuer = self
            .oauth_issuers
            .first()
            .ok_or_else(|| anyhow::anyhow!("at least one --oauth-issuer is required"))?;

        let config = OauthConfig {
            resource_id: resource_id.clone(),
            allowed_issuers: self.oauth_issuers.clone(),
            jwks_url: jwks_url.clone(),
            realm: self.oauth_realm.clone(),
            authorization_uri: format!(
                "{}/.well-known/oauth-authorization-server",
                resource_id.trim_end_matches('/')
            ),
            key_refresh: Duration::from_secs(self.key_refresh_secs),
            discovery: DiscoveryDocument {
                issuer: issuer.clone(),
                authorization_endpoint: self
                    .oauth_authorize_endpoint
                    .clone()
                    .unwrap_or_else(|| format!("{issuer}/authorize")),
                token_endpoint: self
                    .oauth_token_endpoint
                    .clone()
                    .unwrap_or_else(|| format!("{issuer}/token")),
                jwks_uri: jwks_url.clone(),
                scopes_supported: vec![
                    "kb.search".to_string(),
                    "kb.read".to_string(),
                    "system.read".to_string(),
                    "analytics.read".to_string(),
                ],
            },
        };
        config.validate()?;
        Ok(Some(config))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging goes to stderr; stdout belongs to the protocol on stdio
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        server_name: args.server_name.clone(),
        call_timeout: Duration::from_millis(args.call_timeout_ms),
        oauth: args.oauth_config()?,
    };

    let audit = Arc::new(AuditTrail::new());
    let search = Arc::new(SearchProvider::with_sample_data());
    let health = Arc::new(HealthProvider::new(vec![
        "search".to_string(),
        "analytics".to_string(),
    ]));
    let analytics = Arc::new(AnalyticsProvider::new(audit.clone()));
    let providers: Vec<Arc<dyn CapabilityProvider>> = vec![search, health, analytics];

    // Colliding templates or duplicate identities abort startup here
    let registry = Arc::new(CapabilityRegistry::build(providers)?);
    tracing::info!(
        actions = registry.action_count(),
        resources = registry.resource_count(),
        "capability registry built"
    );

    let dispatcher = Arc::new(Dispatcher::new(registry, &config, audit));

    match args.http {
        Some(addr) => {
            let authenticator = match &config.oauth {
                Some(oauth) => {
                    let keys = KeyStore::from_jwks_url(&oauth.jwks_url, oauth.key_refresh);
                    Some(Arc::new(Authenticator::new(oauth.clone(), keys)))
                }
                None => {
                    tracing::warn!("http transport running without an authorization layer");
                    None
                }
            };
            let state = HttpState::new(dispatcher, authenticator);
            HttpServer::new(state, addr).serve().await?;
        }
        None => {
            StdioServer::new(dispatcher).run().await?;
        }
    }

    Ok(())
}
