//! Bearer-token validation.
//!
//! One entry point, [`TokenValidator::validate`], turns a raw bearer token
//! into a verified [`IdentityContext`]:
//!
//! 1. decode the header and peek the unverified `iss` claim,
//! 2. resolve the verification key — the local [`KeyManager`] when the
//!    issuer is this server, the [`JwksClient`] otherwise,
//! 3. verify the RS256 signature,
//! 4. check `exp`, `nbf`, and the audience,
//! 5. normalize the claim set.
//!
//! Every failure is terminal — there is no retry or key refresh here. The
//! error kinds exist for server-side logging; callers surface all of them
//! outward as the uniform [`crate::Error::InvalidToken`].

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::DecodingKey;
use thiserror::Error;
use tracing::debug;

use crate::context::IdentityContext;

use super::jwks_client::{JwksClient, JwksError};
use super::keys::{KeyManager, KeyManagerError, signature_only_validation};

/// Why a token was rejected. Logged server-side, never shown to callers.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Not a decodable JWT, or required claims are missing entirely.
    #[error("Malformed token")]
    Malformed,

    /// The signature does not verify against the resolved key.
    #[error("Invalid token signature")]
    SignatureInvalid,

    /// `exp` is in the past.
    #[error("Token has expired")]
    Expired,

    /// `nbf` is in the future.
    #[error("Token is not yet valid")]
    NotYetValid,

    /// The audience claim does not include the expected audience.
    #[error("Token audience mismatch: expected '{0}'")]
    AudienceMismatch(String),

    /// The issuer's keys could not be discovered.
    #[error("Unknown token issuer: {0}")]
    UnknownIssuer(String),

    /// The key named by the token header is not available.
    #[error("Unknown signing key")]
    UnknownKey,

    /// Key resolution failed for infrastructure reasons (network, bad body).
    #[error("Key resolution failed: {0}")]
    KeyResolution(String),
}

/// Validates bearer tokens from this server and from external providers.
pub struct TokenValidator {
    /// Issuer URL of the embedded authorization server.
    issuer: String,
    /// Audience this service accepts tokens for.
    audience: String,
    keys: Arc<KeyManager>,
    jwks: Arc<JwksClient>,
}

impl TokenValidator {
    /// Create a validator for the given local issuer and audience.
    #[must_use]
    pub fn new(
        issuer: impl Into<String>,
        audience: impl Into<String>,
        keys: Arc<KeyManager>,
        jwks: Arc<JwksClient>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            keys,
            jwks,
        }
    }

    /// Validate a bearer token and produce the caller's identity.
    pub async fn validate(&self, token: &str) -> Result<IdentityContext, ValidationError> {
        let unverified = decode_claims_unverified(token)?;
        let issuer = unverified
            .get("iss")
            .and_then(|v| v.as_str())
            .ok_or(ValidationError::Malformed)?
            .to_string();

        let claims = if issuer == self.issuer {
            self.verify_local(token)?
        } else {
            self.verify_external(token, &issuer).await?
        };

        self.check_timestamps(&claims)?;
        self.check_audience(&claims)?;
        normalize(claims, issuer)
    }

    /// Signature verification against the local key manager.
    fn verify_local(&self, token: &str) -> Result<serde_json::Value, ValidationError> {
        self.keys.verify(token).map_err(|e| {
            debug!(error = %e, "Local token verification failed");
            match e {
                KeyManagerError::UnknownSigningKey => ValidationError::UnknownKey,
                KeyManagerError::InvalidSignature => ValidationError::SignatureInvalid,
                _ => ValidationError::Malformed,
            }
        })
    }

    /// Signature verification against a key published by `issuer`.
    async fn verify_external(
        &self,
        token: &str,
        issuer: &str,
    ) -> Result<serde_json::Value, ValidationError> {
        let header = jsonwebtoken::decode_header(token).map_err(|_| ValidationError::Malformed)?;
        let resolved = self
            .jwks
            .get_key(issuer, header.kid.as_deref(), None)
            .await
            .map_err(|e| {
                debug!(issuer = %issuer, error = %e, "External key resolution failed");
                map_resolution_error(&e, issuer)
            })?;

        let decoding_key = DecodingKey::from_rsa_pem(resolved.pem.as_bytes())
            .map_err(|e| ValidationError::KeyResolution(e.to_string()))?;
        let data = jsonwebtoken::decode::<serde_json::Value>(
            token,
            &decoding_key,
            &signature_only_validation(),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidSignature => ValidationError::SignatureInvalid,
            _ => ValidationError::Malformed,
        })?;
        Ok(data.claims)
    }

    /// Enforce `exp` (required) and `nbf` (optional) against the clock.
    fn check_timestamps(&self, claims: &serde_json::Value) -> Result<(), ValidationError> {
        let now = Utc::now().timestamp();
        let exp = claims
            .get("exp")
            .and_then(serde_json::Value::as_i64)
            .ok_or(ValidationError::Malformed)?;
        // RFC 7519 §4.1.4: the current time must be strictly before exp
        if exp <= now {
            return Err(ValidationError::Expired);
        }
        if let Some(nbf) = claims.get("nbf").and_then(serde_json::Value::as_i64) {
            if nbf > now {
                return Err(ValidationError::NotYetValid);
            }
        }
        Ok(())
    }

    /// The `aud` claim (string or array) must include the expected audience.
    fn check_audience(&self, claims: &serde_json::Value) -> Result<(), ValidationError> {
        let matches = match claims.get("aud") {
            Some(serde_json::Value::String(aud)) => *aud == self.audience,
            Some(serde_json::Value::Array(auds)) => {
                auds.iter().any(|a| a.as_str() == Some(self.audience.as_str()))
            }
            _ => false,
        };
        if matches {
            Ok(())
        } else {
            Err(ValidationError::AudienceMismatch(self.audience.clone()))
        }
    }
}

/// Map a key-resolution failure to the validation kind callers log.
fn map_resolution_error(err: &JwksError, issuer: &str) -> ValidationError {
    match err {
        JwksError::Discovery { .. } => ValidationError::UnknownIssuer(issuer.to_string()),
        JwksError::KeyNotFound { .. } | JwksError::EmptyKeySet { .. } => {
            ValidationError::UnknownKey
        }
        JwksError::Fetch { .. } | JwksError::UnusableKey(_) => {
            ValidationError::KeyResolution(err.to_string())
        }
    }
}

/// Decode the payload segment without verifying anything.
///
/// Only used to read `iss` for key routing; every claim is re-read from the
/// signature-verified decode before it is trusted.
fn decode_claims_unverified(token: &str) -> Result<serde_json::Value, ValidationError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(ValidationError::Malformed),
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| ValidationError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| ValidationError::Malformed)
}

/// Build the normalized identity from a verified claim set.
///
/// Scopes come from either the OAuth2 space-delimited `scope` string or a
/// `scopes` array; groups from a `groups` array. Both default to empty.
fn normalize(
    claims: serde_json::Value,
    issuer: String,
) -> Result<IdentityContext, ValidationError> {
    let user_id = claims
        .get("sub")
        .and_then(|v| v.as_str())
        .ok_or(ValidationError::Malformed)?
        .to_string();

    let groups = string_array(claims.get("groups"));
    let scopes = match claims.get("scope").and_then(|v| v.as_str()) {
        Some(scope) => scope.split_whitespace().map(ToString::to_string).collect(),
        None => string_array(claims.get("scopes")),
    };

    Ok(IdentityContext {
        user_id,
        groups,
        scopes,
        issuer,
        claims,
    })
}

fn string_array(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}
