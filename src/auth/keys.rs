//! RSA signing-key lifecycle: generate, rotate, export, sign, verify.
//!
//! A process holds exactly one *current* key pair plus a bounded retention
//! window of superseded pairs (default 24h) so in-flight tokens signed by a
//! just-rotated key still verify. Rotation never prunes the current pair.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::der;

/// Errors from key management and local token verification.
#[derive(Debug, Error)]
pub enum KeyManagerError {
    /// RSA key pair generation failed.
    #[error("Key generation failed: {0}")]
    Generation(String),

    /// The token header names no key id, or an unretained one.
    ///
    /// Surfaced as an authentication failure, never an internal error.
    #[error("Unknown signing key")]
    UnknownSigningKey,

    /// The token could not be decoded at all.
    #[error("Invalid token format")]
    InvalidTokenFormat,

    /// The signature does not verify against the named key.
    #[error("Invalid token signature")]
    InvalidSignature,

    /// Signing failed (malformed private key material).
    #[error("Signing failed: {0}")]
    Signing(String),

    /// A retained public key could not be re-encoded as a JWK.
    #[error("Key export failed: {0}")]
    Export(#[from] der::DerError),
}

/// One RSA signing key pair.
#[derive(Debug, Clone)]
pub struct SigningKeyPair {
    /// Opaque key identifier embedded in token headers.
    pub kid: String,
    /// SubjectPublicKeyInfo PEM.
    pub public_key_pem: String,
    /// PKCS#8 PEM. Never leaves this module.
    private_key_pem: String,
    /// Creation time, used for retention pruning.
    pub created_at: DateTime<Utc>,
}

/// Signing-key lifecycle manager.
pub struct KeyManager {
    /// All retained pairs, indexed by kid.
    keys: DashMap<String, SigningKeyPair>,
    /// kid of the current signing pair.
    current_kid: RwLock<String>,
    /// Superseded pairs older than this are pruned on rotation.
    retention: Duration,
}

impl KeyManager {
    /// Create a manager with a freshly generated RSA-2048 pair.
    pub fn new(retention: Duration) -> Result<Self, KeyManagerError> {
        let pair = generate_pair()?;
        let kid = pair.kid.clone();
        info!(kid = %kid, "Generated initial signing key");

        let keys = DashMap::new();
        keys.insert(kid.clone(), pair);
        Ok(Self {
            keys,
            current_kid: RwLock::new(kid),
            retention,
        })
    }

    /// The kid of the current signing pair.
    #[must_use]
    pub fn current_kid(&self) -> String {
        self.current_kid.read().clone()
    }

    /// Generate a new pair, make it current, and prune superseded pairs
    /// older than the retention window. Returns the new kid.
    pub fn rotate(&self) -> Result<String, KeyManagerError> {
        let pair = generate_pair()?;
        let new_kid = pair.kid.clone();
        self.keys.insert(new_kid.clone(), pair);
        *self.current_kid.write() = new_kid.clone();

        self.prune_superseded(Utc::now());
        info!(kid = %new_kid, retained = self.keys.len(), "Rotated signing key");
        Ok(new_kid)
    }

    /// Drop superseded pairs created before `now - retention`.
    ///
    /// The current pair is never pruned regardless of age.
    fn prune_superseded(&self, now: DateTime<Utc>) {
        let current = self.current_kid.read().clone();
        let cutoff = now
            - chrono::TimeDelta::from_std(self.retention).unwrap_or(chrono::TimeDelta::zero());
        self.keys.retain(|kid, pair| {
            let keep = *kid == current || pair.created_at >= cutoff;
            if !keep {
                debug!(kid = %kid, "Pruned superseded signing key");
            }
            keep
        });
    }

    /// Number of retained key pairs (current included).
    #[must_use]
    pub fn retained_keys(&self) -> usize {
        self.keys.len()
    }

    /// Export all retained public keys as a JWKS document.
    pub fn jwks(&self) -> Result<serde_json::Value, KeyManagerError> {
        let mut keys = Vec::with_capacity(self.keys.len());
        for entry in &self.keys {
            let components = der::public_key_pem_to_jwk(&entry.public_key_pem)?;
            keys.push(serde_json::json!({
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": entry.kid,
                "n": components.n,
                "e": components.e,
            }));
        }
        Ok(serde_json::json!({ "keys": keys }))
    }

    /// Sign `claims` RS256 with the current key, embedding its kid in the
    /// token header.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, KeyManagerError> {
        let kid = self.current_kid();
        let pair = self.keys.get(&kid).ok_or(KeyManagerError::UnknownSigningKey)?;

        let encoding_key = EncodingKey::from_rsa_pem(pair.private_key_pem.as_bytes())
            .map_err(|e| KeyManagerError::Signing(e.to_string()))?;
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid);

        jsonwebtoken::encode(&header, claims, &encoding_key)
            .map_err(|e| KeyManagerError::Signing(e.to_string()))
    }

    /// Verify a token's RS256 signature against the retained pair named by
    /// its header kid, returning the raw claims.
    ///
    /// Only the signature is checked here; expiry/audience policy belongs to
    /// the token validator.
    pub fn verify(&self, token: &str) -> Result<serde_json::Value, KeyManagerError> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|_| KeyManagerError::InvalidTokenFormat)?;
        let kid = header.kid.ok_or(KeyManagerError::UnknownSigningKey)?;
        let pair = self
            .keys
            .get(&kid)
            .ok_or(KeyManagerError::UnknownSigningKey)?;

        let decoding_key = DecodingKey::from_rsa_pem(pair.public_key_pem.as_bytes())
            .map_err(|e| KeyManagerError::Signing(e.to_string()))?;
        drop(pair);

        let data = jsonwebtoken::decode::<serde_json::Value>(
            token,
            &decoding_key,
            &signature_only_validation(),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidSignature => KeyManagerError::InvalidSignature,
            _ => KeyManagerError::InvalidTokenFormat,
        })?;
        Ok(data.claims)
    }
}

/// RS256 validation that checks the signature and nothing else.
pub(crate) fn signature_only_validation() -> Validation {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    validation
}

/// Generate an RSA-2048 pair tagged with a fresh random kid.
fn generate_pair() -> Result<SigningKeyPair, KeyManagerError> {
    let pair = josekit::jwk::alg::rsa::RsaKeyPair::generate(2048)
        .map_err(|e| KeyManagerError::Generation(e.to_string()))?;

    let private_key_pem = String::from_utf8(pair.to_pem_private_key())
        .map_err(|e| KeyManagerError::Generation(e.to_string()))?;
    let public_key_pem = der::wrap_pem("PUBLIC KEY", &pair.to_der_public_key());

    Ok(SigningKeyPair {
        kid: Uuid::new_v4().to_string(),
        public_key_pem,
        private_key_pem,
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RETENTION: Duration = Duration::from_secs(24 * 3600);

    fn claims(sub: &str) -> serde_json::Value {
        serde_json::json!({"sub": sub, "iss": "http://localhost:9001"})
    }

    // ── sign / verify ─────────────────────────────────────────────────────

    #[test]
    fn signed_token_verifies_with_same_manager() {
        let manager = KeyManager::new(RETENTION).unwrap();
        let token = manager.sign(&claims("alice")).unwrap();

        let verified = manager.verify(&token).unwrap();
        assert_eq!(verified["sub"], "alice");
    }

    #[test]
    fn token_header_carries_current_kid() {
        let manager = KeyManager::new(RETENTION).unwrap();
        let token = manager.sign(&claims("alice")).unwrap();

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.kid, Some(manager.current_kid()));
        assert_eq!(header.alg, Algorithm::RS256);
    }

    #[test]
    fn garbage_token_is_invalid_format() {
        let manager = KeyManager::new(RETENTION).unwrap();
        assert!(matches!(
            manager.verify("not-a-jwt"),
            Err(KeyManagerError::InvalidTokenFormat)
        ));
    }

    #[test]
    fn token_without_kid_is_unknown_signing_key() {
        // GIVEN: a structurally valid token whose header lacks a kid
        let manager = KeyManager::new(RETENTION).unwrap();
        let pair = josekit::jwk::alg::rsa::RsaKeyPair::generate(2048).unwrap();
        let key = EncodingKey::from_rsa_pem(&pair.to_pem_private_key()).unwrap();
        let token =
            jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims("x"), &key).unwrap();

        assert!(matches!(
            manager.verify(&token),
            Err(KeyManagerError::UnknownSigningKey)
        ));
    }

    #[test]
    fn token_from_foreign_key_with_known_kid_fails_signature() {
        // GIVEN: a token carrying a retained kid but signed by a foreign key
        let manager = KeyManager::new(RETENTION).unwrap();
        let pair = josekit::jwk::alg::rsa::RsaKeyPair::generate(2048).unwrap();
        let key = EncodingKey::from_rsa_pem(&pair.to_pem_private_key()).unwrap();
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(manager.current_kid());
        let token = jsonwebtoken::encode(&header, &claims("x"), &key).unwrap();

        assert!(matches!(
            manager.verify(&token),
            Err(KeyManagerError::InvalidSignature)
        ));
    }

    // ── rotation ──────────────────────────────────────────────────────────

    #[test]
    fn rotation_keeps_old_tokens_verifiable_within_retention() {
        let manager = KeyManager::new(RETENTION).unwrap();
        let old_kid = manager.current_kid();
        let old_token = manager.sign(&claims("alice")).unwrap();

        let new_kid = manager.rotate().unwrap();
        assert_ne!(old_kid, new_kid);

        // Old token still verifies; new signings use the new kid
        assert!(manager.verify(&old_token).is_ok());
        let new_token = manager.sign(&claims("bob")).unwrap();
        let header = jsonwebtoken::decode_header(&new_token).unwrap();
        assert_eq!(header.kid, Some(new_kid));
        assert_eq!(manager.retained_keys(), 2);
    }

    #[test]
    fn zero_retention_prunes_superseded_but_never_current() {
        let manager = KeyManager::new(Duration::ZERO).unwrap();
        let old_token = manager.sign(&claims("alice")).unwrap();

        manager.rotate().unwrap();

        // The superseded pair is gone; the current pair survives
        assert_eq!(manager.retained_keys(), 1);
        assert!(matches!(
            manager.verify(&old_token),
            Err(KeyManagerError::UnknownSigningKey)
        ));
        assert!(manager.verify(&manager.sign(&claims("bob")).unwrap()).is_ok());
    }

    // ── JWKS export ───────────────────────────────────────────────────────

    #[test]
    fn jwks_exports_all_retained_keys() {
        let manager = KeyManager::new(RETENTION).unwrap();
        manager.rotate().unwrap();

        let jwks = manager.jwks().unwrap();
        let keys = jwks["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 2);
        for key in keys {
            assert_eq!(key["kty"], "RSA");
            assert_eq!(key["use"], "sig");
            assert_eq!(key["alg"], "RS256");
            assert!(key["kid"].is_string());
            assert!(key["n"].is_string());
            assert_eq!(key["e"], "AQAB");
        }
    }

    #[test]
    fn jwks_components_reconstruct_a_working_decoding_key() {
        let manager = KeyManager::new(RETENTION).unwrap();
        let token = manager.sign(&claims("alice")).unwrap();

        let jwks = manager.jwks().unwrap();
        let key = &jwks["keys"][0];
        let decoding_key = DecodingKey::from_rsa_components(
            key["n"].as_str().unwrap(),
            key["e"].as_str().unwrap(),
        )
        .unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        assert!(
            jsonwebtoken::decode::<serde_json::Value>(&token, &decoding_key, &validation).is_ok()
        );
    }
}
