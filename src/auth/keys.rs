//! Signing-key cache for token validation
//!
//! Keys come from the issuer's JWKS endpoint and are cached with a bounded
//! refresh interval, so steady-state authentication never waits on the
//! network. Refresh is single-writer behind an RwLock; concurrent readers
//! keep serving the stale set while one task fetches.

use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey, Header};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::AuthError;

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

struct CachedKeys {
    keys: Vec<Jwk>,
    fetched_at: Instant,
}

enum KeySource {
    /// Asymmetric keys fetched from the issuer's JWKS endpoint
    Jwks {
        url: String,
        refresh: Duration,
        http: reqwest::Client,
        cache: RwLock<Option<CachedKeys>>,
    },
    /// A pre-shared HMAC secret. Used for symmetric-issuer deployments and
    /// in tests, where it keeps the full gate sequence exercisable without
    /// a network fetch.
    SharedSecret(Vec<u8>),
}

pub struct KeyStore {
    source: KeySource,
}

impl KeyStore {
    pub fn from_jwks_url(url: &str, refresh: Duration) -> Self {
        Self {
            source: KeySource::Jwks {
                url: url.to_string(),
                refresh,
                http: reqwest::Client::new(),
                cache: RwLock::new(None),
            },
        }
    }

    pub fn with_shared_secret(secret: &[u8]) -> Self {
        Self {
            source: KeySource::SharedSecret(secret.to_vec()),
        }
    }

    /// Resolve the decoding key for a token header, refreshing the cached
    /// JWKS set when it has gone stale
    pub async fn decoding_key(&self, header: &Header) -> Result<DecodingKey, AuthError> {
        match &self.source {
            KeySource::SharedSecret(secret) => match header.alg {
                Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                    Ok(DecodingKey::from_secret(secret))
                }
                other => Err(AuthError::Malformed(format!(
                    "algorithm {other:?} not usable with a shared secret"
                ))),
            },
            KeySource::Jwks {
                url,
                refresh,
                http,
                cache,
            } => {
                match header.alg {
                    Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {}
                    other => {
                        return Err(AuthError::Malformed(format!(
                            "algorithm {other:?} not supported by the key set"
                        )))
                    }
                }

                {
                    let cached = cache.read().await;
                    if let Some(cached) = cached.as_ref() {
                        if cached.fetched_at.elapsed() < *refresh {
                            return key_from_set(&cached.keys, header.kid.as_deref());
                        }
                    }
                }

                let mut cached = cache.write().await;
                // Another writer may have refreshed while we waited
                let stale = cached
                    .as_ref()
                    .map(|c| c.fetched_at.elapsed() >= *refresh)
                    .unwrap_or(true);
                if stale {
                    let keys = fetch_jwks(http, url).await?;
                    *cached = Some(CachedKeys {
                        keys,
                        fetched_at: Instant::now(),
                    });
                    tracing::debug!(url, "refreshed signing key set");
                }
                match cached.as_ref() {
                    Some(cached) => key_from_set(&cached.keys, header.kid.as_deref()),
                    None => Err(AuthError::KeySetUnavailable("key cache empty".into())),
                }
            }
        }
    }
}

async fn fetch_jwks(http: &reqwest::Client, url: &str) -> Result<Vec<Jwk>, AuthError> {
    let doc: JwksDocument = http
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| AuthError::KeySetUnavailable(e.to_string()))?
        .json()
        .await
        .map_err(|e| AuthError::KeySetUnavailable(e.to_string()))?;
    Ok(doc.keys)
}

fn key_from_set(keys: &[Jwk], kid: Option<&str>) -> Result<DecodingKey, AuthError> {
    let jwk = match kid {
        Some(kid) => keys.iter().find(|k| k.kid.as_deref() == Some(kid)),
        // A header without a kid is only unambiguous with a single key
        None if keys.len() == 1 => keys.first(),
        None => None,
    }
    .ok_or(AuthError::BadSignature)?;

    if jwk.kty != "RSA" {
        return Err(AuthError::Malformed(format!(
            "unsupported key type '{}'",
            jwk.kty
        )));
    }
    let (n, e) = match (&jwk.n, &jwk.e) {
        (Some(n), Some(e)) => (n, e),
        _ => return Err(AuthError::Malformed("RSA key missing components".into())),
    };
    DecodingKey::from_rsa_components(n, e).map_err(|e| AuthError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_secret_rejects_asymmetric_header() {
        let store = KeyStore::with_shared_secret(b"secret");
        let header = Header::new(Algorithm::RS256);
        assert!(store.decoding_key(&header).await.is_err());
    }

    #[tokio::test]
    async fn test_shared_secret_serves_hmac() {
        let store = KeyStore::with_shared_secret(b"secret");
        let header = Header::new(Algorithm::HS256);
        assert!(store.decoding_key(&header).await.is_ok());
    }

    #[test]
    fn test_key_selection_by_kid() {
        let keys = vec![
            Jwk {
                kty: "RSA".into(),
                kid: Some("a".into()),
                n: Some("4Zs8Qz".into()),
                e: Some("AQAB".into()),
            },
            Jwk {
                kty: "RSA".into(),
                kid: Some("b".into()),
                n: Some("uJ9zXw".into()),
                e: Some("AQAB".into()),
            },
        ];
        assert!(key_from_set(&keys, Some("b")).is_ok());
        assert!(key_from_set(&keys, Some("missing")).is_err());
        // Two keys and no kid is ambiguous
        assert!(key_from_set(&keys, None).is_err());
    }
}
