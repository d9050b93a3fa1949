//! External key resolution — OIDC discovery and JWKS caching.
//!
//! Tokens issued by third-party identity providers are verified against keys
//! this process never minted. Resolution is two HTTP hops, both cached:
//!
//! 1. `{issuer}/.well-known/openid-configuration` → `jwks_uri`
//!    (cached by issuer, 24h TTL — discovery documents rarely change).
//! 2. `jwks_uri` → key set (cached by URI, 1h TTL).
//!
//! Expired entries are pruned on access so long-lived processes do not
//! accumulate dead cache entries. Concurrent requests for a cold issuer each
//! fetch independently — no request coalescing; the TTLs make the duplicate
//! fetches cheap and rare.
//!
//! Network failures are infrastructure errors: retryable by the caller,
//! never retried here.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::der;

/// HTTP timeout for discovery and key-set fetches.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from external key resolution.
///
/// The variants matter to the token validator: a missing key is an
/// authentication failure, while fetch failures are retryable
/// infrastructure problems.
#[derive(Debug, Error)]
pub enum JwksError {
    /// OIDC discovery failed or returned an unusable document.
    #[error("Discovery failed for issuer {issuer}: {reason}")]
    Discovery {
        /// Issuer whose discovery document was requested.
        issuer: String,
        /// What went wrong.
        reason: String,
    },

    /// The key-set endpoint failed or returned an unusable body.
    #[error("Key set fetch failed for {uri}: {reason}")]
    Fetch {
        /// Key-set URI that was fetched.
        uri: String,
        /// What went wrong.
        reason: String,
    },

    /// The key set holds no key with the requested kid.
    #[error("No key with kid '{kid}' in key set at {uri}")]
    KeyNotFound {
        /// Requested key id.
        kid: String,
        /// Key-set URI that was searched.
        uri: String,
    },

    /// The key set holds no keys at all.
    #[error("Empty key set at {uri}")]
    EmptyKeySet {
        /// Key-set URI that was searched.
        uri: String,
    },

    /// The selected key cannot be used for RS256 verification.
    #[error("Unusable key: {0}")]
    UnusableKey(String),
}

impl From<JwksError> for crate::Error {
    fn from(err: JwksError) -> Self {
        Self::KeySetFetch(err.to_string())
    }
}

/// An RSA JWK as published by an identity provider.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key id.
    #[serde(default)]
    pub kid: Option<String>,
    /// Key type (`RSA` expected).
    #[serde(default)]
    pub kty: Option<String>,
    /// Declared use (`sig` preferred during selection).
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,
    /// Modulus, base64url.
    #[serde(default)]
    pub n: Option<String>,
    /// Exponent, base64url.
    #[serde(default)]
    pub e: Option<String>,
}

/// A published key-set document. A missing `keys` array is a parse error.
#[derive(Debug, Deserialize)]
struct KeySetDoc {
    keys: Vec<Jwk>,
}

/// The subset of an OIDC discovery document this client needs.
#[derive(Debug, Deserialize)]
struct DiscoveryDoc {
    #[serde(default)]
    jwks_uri: Option<String>,
}

/// A key resolved from an external provider, ready for verification.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    /// Key id, when the provider published one.
    pub kid: Option<String>,
    /// Modulus, base64url.
    pub n: String,
    /// Exponent, base64url.
    pub e: String,
    /// SubjectPublicKeyInfo PEM rebuilt from the components.
    pub pem: String,
}

struct CachedDiscovery {
    jwks_uri: String,
    expires_at: Instant,
}

struct CachedKeySet {
    keys: Vec<Jwk>,
    expires_at: Instant,
}

/// Cache entry counts, for operational visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Cached discovery documents (by issuer).
    pub discovery_entries: usize,
    /// Cached key sets (by URI).
    pub jwks_entries: usize,
}

/// Client for keys published by external identity providers.
pub struct JwksClient {
    http: reqwest::Client,
    discovery_cache: DashMap<String, CachedDiscovery>,
    jwks_cache: DashMap<String, CachedKeySet>,
    discovery_ttl: Duration,
    jwks_ttl: Duration,
}

impl JwksClient {
    /// Create with the given cache TTLs (typically 24h discovery, 1h JWKS).
    ///
    /// # Errors
    ///
    /// [`crate::Error::Internal`] when the HTTP client cannot be built
    /// (TLS backend misconfiguration). The bounded fetch timeout is part of
    /// the contract, so there is no fallback to an unbounded client.
    pub fn new(discovery_ttl: Duration, jwks_ttl: Duration) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| crate::Error::Internal(format!("HTTP client initialization: {e}")))?;
        Ok(Self {
            http,
            discovery_cache: DashMap::new(),
            jwks_cache: DashMap::new(),
            discovery_ttl,
            jwks_ttl,
        })
    }

    /// Resolve a verification key for `issuer`.
    ///
    /// When `jwks_uri` is given, discovery is skipped. When `kid` is given
    /// the key must match exactly; otherwise selection prefers a single key,
    /// then a key declared for signature use, then the first key.
    pub async fn get_key(
        &self,
        issuer: &str,
        kid: Option<&str>,
        jwks_uri: Option<&str>,
    ) -> Result<ResolvedKey, JwksError> {
        self.prune_expired();

        let uri = match jwks_uri {
            Some(uri) => uri.to_string(),
            None => self.resolve_jwks_uri(issuer).await?,
        };
        let keys = self.fetch_key_set(&uri).await?;
        let jwk = select_key(&keys, kid)
            .ok_or_else(|| match kid {
                Some(kid) => JwksError::KeyNotFound {
                    kid: kid.to_string(),
                    uri: uri.clone(),
                },
                None => JwksError::EmptyKeySet { uri: uri.clone() },
            })?
            .clone();
        to_resolved(jwk)
    }

    /// Drop all cached discovery documents and key sets.
    pub fn clear_cache(&self) {
        self.discovery_cache.clear();
        self.jwks_cache.clear();
    }

    /// Current cache entry counts.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            discovery_entries: self.discovery_cache.len(),
            jwks_entries: self.jwks_cache.len(),
        }
    }

    /// Resolve the key-set URI for `issuer` via OIDC discovery, cached.
    async fn resolve_jwks_uri(&self, issuer: &str) -> Result<String, JwksError> {
        if let Some(cached) = self.discovery_cache.get(issuer) {
            if Instant::now() < cached.expires_at {
                return Ok(cached.jwks_uri.clone());
            }
        }

        let discovery_err = |reason: String| JwksError::Discovery {
            issuer: issuer.to_string(),
            reason,
        };
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        debug!(issuer = %issuer, "Fetching OIDC discovery document");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| discovery_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(discovery_err(format!("HTTP {}", response.status())));
        }
        let doc: DiscoveryDoc = response
            .json()
            .await
            .map_err(|e| discovery_err(format!("malformed document: {e}")))?;
        let jwks_uri = doc
            .jwks_uri
            .ok_or_else(|| discovery_err("document has no jwks_uri".to_string()))?;

        self.discovery_cache.insert(
            issuer.to_string(),
            CachedDiscovery {
                jwks_uri: jwks_uri.clone(),
                expires_at: Instant::now() + self.discovery_ttl,
            },
        );
        Ok(jwks_uri)
    }

    /// Fetch the key set at `uri`, cached. A fresh cache hit is served
    /// without a network call.
    async fn fetch_key_set(&self, uri: &str) -> Result<Vec<Jwk>, JwksError> {
        if let Some(cached) = self.jwks_cache.get(uri) {
            if Instant::now() < cached.expires_at {
                return Ok(cached.keys.clone());
            }
        }

        let fetch_err = |reason: String| JwksError::Fetch {
            uri: uri.to_string(),
            reason,
        };
        debug!(uri = %uri, "Fetching key set");
        let response = self
            .http
            .get(uri)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_err(format!("HTTP {}", response.status())));
        }
        let doc: KeySetDoc = response
            .json()
            .await
            .map_err(|e| fetch_err(format!("malformed key set: {e}")))?;

        self.jwks_cache.insert(
            uri.to_string(),
            CachedKeySet {
                keys: doc.keys.clone(),
                expires_at: Instant::now() + self.jwks_ttl,
            },
        );
        Ok(doc.keys)
    }

    /// Remove expired entries from both caches.
    fn prune_expired(&self) {
        let now = Instant::now();
        self.discovery_cache.retain(|_, e| now < e.expires_at);
        self.jwks_cache.retain(|_, e| now < e.expires_at);
    }
}

/// Select a key from a set.
///
/// Exact kid match when a kid is requested; otherwise a single key wins,
/// then a key declared `use: "sig"`, then the first key.
fn select_key<'a>(keys: &'a [Jwk], kid: Option<&str>) -> Option<&'a Jwk> {
    if let Some(kid) = kid {
        return keys.iter().find(|k| k.kid.as_deref() == Some(kid));
    }
    if keys.len() == 1 {
        return keys.first();
    }
    keys.iter()
        .find(|k| k.key_use.as_deref() == Some("sig"))
        .or_else(|| keys.first())
}

/// Convert a selected JWK into a [`ResolvedKey`], rebuilding the PEM.
fn to_resolved(jwk: Jwk) -> Result<ResolvedKey, JwksError> {
    if let Some(kty) = jwk.kty.as_deref() {
        if kty != "RSA" {
            return Err(JwksError::UnusableKey(format!(
                "unsupported key type '{kty}', only RSA is supported"
            )));
        }
    }
    let (Some(n), Some(e)) = (jwk.n, jwk.e) else {
        return Err(JwksError::UnusableKey(
            "missing RSA components (n, e)".to_string(),
        ));
    };
    let pem = der::jwk_to_public_key_pem(&n, &e)
        .map_err(|err| JwksError::UnusableKey(format!("components are not valid base64url: {err}")))?;
    Ok(ResolvedKey { kid: jwk.kid, n, e, pem })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn client() -> JwksClient {
        JwksClient::new(Duration::from_secs(24 * 3600), Duration::from_secs(3600)).unwrap()
    }

    fn jwk(kid: Option<&str>, key_use: Option<&str>) -> Jwk {
        Jwk {
            kid: kid.map(ToString::to_string),
            kty: Some("RSA".to_string()),
            key_use: key_use.map(ToString::to_string),
            n: Some("AQAB".to_string()),
            e: Some("AQAB".to_string()),
        }
    }

    // ── select_key ────────────────────────────────────────────────────────

    #[test]
    fn select_requires_exact_kid_match_when_given() {
        let keys = vec![jwk(Some("a"), None), jwk(Some("b"), None)];
        assert_eq!(select_key(&keys, Some("b")).unwrap().kid.as_deref(), Some("b"));
        assert!(select_key(&keys, Some("missing")).is_none());
    }

    #[test]
    fn select_uses_single_key_without_kid() {
        let keys = vec![jwk(Some("only"), None)];
        assert_eq!(select_key(&keys, None).unwrap().kid.as_deref(), Some("only"));
    }

    #[test]
    fn select_prefers_signature_use_among_many() {
        let keys = vec![
            jwk(Some("enc"), Some("enc")),
            jwk(Some("sig"), Some("sig")),
        ];
        assert_eq!(select_key(&keys, None).unwrap().kid.as_deref(), Some("sig"));
    }

    #[test]
    fn select_falls_back_to_first_key() {
        let keys = vec![jwk(Some("first"), None), jwk(Some("second"), None)];
        assert_eq!(select_key(&keys, None).unwrap().kid.as_deref(), Some("first"));
    }

    #[test]
    fn select_on_empty_set_is_none() {
        assert!(select_key(&[], None).is_none());
        assert!(select_key(&[], Some("kid")).is_none());
    }

    // ── caches ────────────────────────────────────────────────────────────

    #[test]
    fn cache_stats_and_clear() {
        let client = client();
        client.discovery_cache.insert(
            "https://idp.example.com".to_string(),
            CachedDiscovery {
                jwks_uri: "https://idp.example.com/jwks".to_string(),
                expires_at: Instant::now() + Duration::from_secs(60),
            },
        );
        client.jwks_cache.insert(
            "https://idp.example.com/jwks".to_string(),
            CachedKeySet {
                keys: vec![jwk(Some("a"), None)],
                expires_at: Instant::now() + Duration::from_secs(60),
            },
        );

        assert_eq!(
            client.cache_stats(),
            CacheStats { discovery_entries: 1, jwks_entries: 1 }
        );

        client.clear_cache();
        assert_eq!(
            client.cache_stats(),
            CacheStats { discovery_entries: 0, jwks_entries: 0 }
        );
    }

    #[test]
    fn prune_drops_only_expired_entries() {
        let client = client();
        // An entry expiring "now" is already stale
        client.jwks_cache.insert(
            "stale".to_string(),
            CachedKeySet { keys: vec![], expires_at: Instant::now() },
        );
        client.jwks_cache.insert(
            "fresh".to_string(),
            CachedKeySet {
                keys: vec![],
                expires_at: Instant::now() + Duration::from_secs(60),
            },
        );

        client.prune_expired();
        assert_eq!(client.cache_stats().jwks_entries, 1);
        assert!(client.jwks_cache.contains_key("fresh"));
    }

    // ── network paths ─────────────────────────────────────────────────────

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A one-endpoint HTTP server answering every request with the same
    /// canned response, counting the requests it receives.
    async fn spawn_http_server(
        status: &'static str,
        body: String,
    ) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    fn rsa_jwk_body(kid: &str) -> String {
        let pair = josekit::jwk::alg::rsa::RsaKeyPair::generate(2048).unwrap();
        let components = der::spki_to_jwk(&pair.to_der_public_key()).unwrap();
        serde_json::json!({
            "keys": [{
                "kid": kid,
                "kty": "RSA",
                "use": "sig",
                "n": components.n,
                "e": components.e,
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn discovery_document_without_jwks_uri_is_rejected() {
        // GIVEN: an issuer whose discovery document lacks jwks_uri
        let (issuer, _) =
            spawn_http_server("200 OK", r#"{"issuer":"https://idp.example.com"}"#.to_string())
                .await;

        let err = client().get_key(&issuer, None, None).await.unwrap_err();

        assert!(matches!(err, JwksError::Discovery { .. }));
        assert!(err.to_string().contains("no jwks_uri"));
    }

    #[tokio::test]
    async fn key_set_http_error_is_a_descriptive_fetch_error() {
        let (base, _) = spawn_http_server("500 Internal Server Error", String::new()).await;
        let uri = format!("{base}/jwks");

        let err = client()
            .get_key("https://idp.example.com", Some("k1"), Some(&uri))
            .await
            .unwrap_err();

        assert!(matches!(err, JwksError::Fetch { .. }));
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn non_json_key_set_body_is_a_descriptive_fetch_error() {
        let (base, _) = spawn_http_server("200 OK", "<html>not a key set</html>".to_string()).await;
        let uri = format!("{base}/jwks");

        let err = client()
            .get_key("https://idp.example.com", Some("k1"), Some(&uri))
            .await
            .unwrap_err();

        assert!(matches!(err, JwksError::Fetch { .. }));
        assert!(err.to_string().contains("malformed key set"));
    }

    #[tokio::test]
    async fn fresh_key_set_cache_hit_skips_the_network() {
        let (base, hits) = spawn_http_server("200 OK", rsa_jwk_body("k1")).await;
        let uri = format!("{base}/jwks");
        let client = client();

        let first = client
            .get_key("https://idp.example.com", Some("k1"), Some(&uri))
            .await
            .unwrap();
        let second = client
            .get_key("https://idp.example.com", Some("k1"), Some(&uri))
            .await
            .unwrap();

        assert_eq!(first.kid.as_deref(), Some("k1"));
        assert_eq!(second.n, first.n);
        // The second resolution was served from the key-set cache
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discovery_resolves_the_key_set_uri_and_caches_it() {
        // GIVEN: an issuer serving a discovery document pointing at its own
        // key-set endpoint
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let issuer = format!("http://{addr}");
        let discovery_body =
            serde_json::json!({ "jwks_uri": format!("{issuer}/jwks") }).to_string();
        let keys_body = rsa_jwk_body("k1");
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 2048];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                let body = if request.starts_with("GET /.well-known/openid-configuration") {
                    &discovery_body
                } else {
                    &keys_body
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        let client = client();
        let resolved = client.get_key(&issuer, Some("k1"), None).await.unwrap();

        assert_eq!(resolved.kid.as_deref(), Some("k1"));
        assert_eq!(client.cache_stats().discovery_entries, 1);
        assert_eq!(client.cache_stats().jwks_entries, 1);
    }

    // ── conversion ────────────────────────────────────────────────────────

    #[test]
    fn resolved_key_rebuilds_a_parseable_pem() {
        let pair = josekit::jwk::alg::rsa::RsaKeyPair::generate(2048).unwrap();
        let components = der::spki_to_jwk(&pair.to_der_public_key()).unwrap();
        let jwk = Jwk {
            kid: Some("k1".to_string()),
            kty: Some("RSA".to_string()),
            key_use: Some("sig".to_string()),
            n: Some(components.n.clone()),
            e: Some(components.e.clone()),
        };

        let resolved = to_resolved(jwk).unwrap();
        assert_eq!(resolved.kid.as_deref(), Some("k1"));
        assert_eq!(resolved.n, components.n);
        assert!(jsonwebtoken::DecodingKey::from_rsa_pem(resolved.pem.as_bytes()).is_ok());
    }

    #[test]
    fn jwks_errors_surface_as_key_set_fetch() {
        let err: crate::Error = JwksError::EmptyKeySet {
            uri: "https://idp.example.com/jwks".to_string(),
        }
        .into();
        assert!(matches!(err, crate::Error::KeySetFetch(_)));
    }

    #[test]
    fn non_rsa_key_is_rejected() {
        let jwk = Jwk {
            kid: None,
            kty: Some("EC".to_string()),
            key_use: None,
            n: None,
            e: None,
        };
        assert!(to_resolved(jwk).is_err());
    }

    #[test]
    fn key_missing_components_is_rejected() {
        let jwk = Jwk {
            kid: None,
            kty: Some("RSA".to_string()),
            key_use: None,
            n: None,
            e: None,
        };
        assert!(to_resolved(jwk).is_err());
    }
}
