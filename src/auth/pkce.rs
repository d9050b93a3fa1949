//! PKCE (RFC 7636) verifier/challenge validation.
//!
//! Only the `S256` method is accepted; `plain` leaks the verifier to anyone
//! who can observe the authorization request and is rejected outright.
//! The challenge comparison is constant-time.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Errors from PKCE validation, precise enough for server-side logging.
#[derive(Debug, Error)]
pub enum PkceError {
    /// Any method other than `S256`.
    #[error("Unsupported code challenge method: {0}. Only S256 is supported")]
    UnsupportedMethod(String),

    /// Verifier outside the 43–128 character band.
    #[error("Invalid code verifier length: {0}. Must be between 43 and 128 characters")]
    InvalidVerifierLength(usize),

    /// Verifier containing characters outside `[A-Za-z0-9-._~]`.
    #[error("Code verifier contains invalid characters")]
    InvalidVerifierCharacters,

    /// The derived challenge does not match the supplied one.
    #[error("Code challenge does not match verifier")]
    ChallengeMismatch,
}

/// Compute the S256 challenge for a verifier: SHA-256, then base64url
/// without padding.
#[must_use]
pub fn generate_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Boolean-only pre-flight check; does not reveal which rule failed.
#[must_use]
pub fn is_valid_verifier(verifier: &str) -> bool {
    check_verifier(verifier).is_ok()
}

/// Validate a verifier against a stored challenge.
///
/// Checks, in order: method is `S256`, verifier length, verifier alphabet,
/// then the constant-time digest comparison.
pub fn validate(verifier: &str, challenge: &str, method: &str) -> Result<(), PkceError> {
    if method != "S256" {
        return Err(PkceError::UnsupportedMethod(method.to_string()));
    }
    check_verifier(verifier)?;

    let computed = generate_challenge(verifier);
    if bool::from(computed.as_bytes().ct_eq(challenge.as_bytes())) {
        Ok(())
    } else {
        Err(PkceError::ChallengeMismatch)
    }
}

fn check_verifier(verifier: &str) -> Result<(), PkceError> {
    let len = verifier.len();
    if !(43..=128).contains(&len) {
        return Err(PkceError::InvalidVerifierLength(len));
    }
    // RFC 7636 §4.1: unreserved characters only
    if !verifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
    {
        return Err(PkceError::InvalidVerifierCharacters);
    }
    Ok(())
}
