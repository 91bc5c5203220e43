//! Resource-server authorization (HTTP transport only)
//!
//! This server never issues tokens; it validates bearer tokens minted by an
//! external identity provider. `authenticate` runs four ordered gates:
//! signature against the issuer's key set, expiry, audience, issuer
//! allow-list. Any failure rejects the request outright.
//!
//! The audience gate is the token-passthrough defense: a token whose `aud`
//! claim names any other service is rejected even when everything else
//! checks out, and the caller's token is never forwarded downstream.

pub mod keys;
pub mod sessions;

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::OauthConfig;
use crate::error::AlmanacError;
use crate::registry::Capability;
pub use keys::KeyStore;
pub use sessions::SessionStore;

/// Authorization failure, split so transports can answer 401 vs 403
/// correctly: authentication failures name an unknown caller, scope and
/// session failures name a known caller who is not permitted.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token signature verification failed")]
    BadSignature,

    #[error("Token is expired")]
    Expired,

    #[error("Token audience does not include '{expected}'")]
    WrongAudience { expected: String },

    #[error("Token issuer '{0}' is not trusted")]
    UnknownIssuer(String),

    #[error("Token lacks required scope '{scope}'")]
    InsufficientScope { scope: String },

    #[error("Unknown session id")]
    UnknownSession,

    #[error("Session is bound to a different subject")]
    SessionMismatch,

    #[error("Session id already bound")]
    SessionConflict,

    #[error("Signing key set unavailable: {0}")]
    KeySetUnavailable(String),
}

impl AuthError {
    /// HTTP status this failure maps to. 401 means "unknown caller",
    /// 403 means "known caller, not permitted" - clients rely on the split.
    pub fn status(&self) -> u16 {
        match self {
            AuthError::InsufficientScope { .. } | AuthError::SessionMismatch => 403,
            AuthError::SessionConflict => 409,
            AuthError::UnknownSession => 400,
            AuthError::KeySetUnavailable(_) => 503,
            _ => 401,
        }
    }
}

impl From<AuthError> for AlmanacError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InsufficientScope { .. } | AuthError::SessionMismatch => {
                AlmanacError::Forbidden(err.to_string())
            }
            AuthError::SessionConflict => AlmanacError::Conflict(err.to_string()),
            AuthError::UnknownSession => AlmanacError::Ordering(err.to_string()),
            other => AlmanacError::Auth(other.to_string()),
        }
    }
}

/// Granted scopes carried by a token, parsed from the space-delimited
/// OAuth `scope` claim
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    pub fn from_claim(scope: &str) -> Self {
        Self(
            scope
                .split_whitespace()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Derived once per request from a validated bearer token. Never cached
/// across requests - every call re-derives it, so a revoked or expired
/// token stops working on the next request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: String,
    pub issuer: String,
    pub audience: String,
    pub scopes: ScopeSet,
    pub expires_at: DateTime<Utc>,
}

/// The `aud` claim is a string or an array of strings depending on issuer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, candidate: &str) -> bool {
        match self {
            Audience::One(aud) => aud == candidate,
            Audience::Many(auds) => auds.iter().any(|a| a == candidate),
        }
    }
}

/// Claims this server reads from a bearer token
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub aud: Audience,
    pub exp: i64,
    #[serde(default)]
    pub scope: String,
}

/// Validates bearer tokens against the configured issuer and audience
pub struct Authenticator {
    config: OauthConfig,
    keys: KeyStore,
}

impl Authenticator {
    pub fn new(config: OauthConfig, keys: KeyStore) -> Self {
        Self { config, keys }
    }

    pub fn config(&self) -> &OauthConfig {
        &self.config
    }

    /// `WWW-Authenticate` challenge value for 401 responses, pointing the
    /// caller at this server's discovery endpoint
    pub fn challenge(&self) -> String {
        format!(
            "Bearer realm=\"{}\", authorization_uri=\"{}\"",
            self.config.realm, self.config.authorization_uri
        )
    }

    /// Run the ordered gates over a raw bearer token.
    ///
    /// Gate order is fixed: signature, expiry, audience, issuer. Expiry and
    /// claim checks are done here rather than delegated to the JWT library
    /// so a failure is attributable to exactly one gate.
    pub async fn authenticate(&self, raw_token: &str) -> Result<AuthContext, AuthError> {
        let header = jsonwebtoken::decode_header(raw_token)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;

        // Gate 1: signature
        let key = self.keys.decoding_key(&header).await?;
        let mut validation = jsonwebtoken::Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        let token = jsonwebtoken::decode::<Claims>(raw_token, &key, &validation)
            .map_err(|_| AuthError::BadSignature)?;
        let claims = token.claims;

        // Gate 2: expiry
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| AuthError::Malformed("exp claim out of range".into()))?;
        if expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }

        // Gate 3: audience must name this server, nothing else counts
        if !claims.aud.contains(&self.config.resource_id) {
            return Err(AuthError::WrongAudience {
                expected: self.config.resource_id.clone(),
            });
        }

        // Gate 4: issuer allow-list
        if !self.config.allowed_issuers.iter().any(|i| i == &claims.iss) {
            return Err(AuthError::UnknownIssuer(claims.iss));
        }

        Ok(AuthContext {
            subject: claims.sub,
            issuer: claims.iss,
            audience: self.config.resource_id.clone(),
            scopes: ScopeSet::from_claim(&claims.scope),
            expires_at,
        })
    }
}

/// Gate one capability invocation on the caller's granted scopes.
/// A miss here is a 403, never a 401 - the caller is known, just not
/// permitted.
pub fn authorize(ctx: &AuthContext, capability: &Capability) -> Result<(), AuthError> {
    if ctx.scopes.contains(&capability.required_scope) {
        Ok(())
    } else {
        Err(AuthError::InsufficientScope {
            scope: capability.required_scope.clone(),
        })
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value
pub fn extract_bearer(header_value: &str) -> Result<&str, AuthError> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)
}
