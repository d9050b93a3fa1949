//! Embedded OAuth2/OIDC authorization server.
//!
//! # Pieces
//!
//! - [`keys`] — RSA signing-key lifecycle: generate, rotate with a bounded
//!   retention window, export the public key set, sign/verify RS256 tokens.
//! - [`pkce`] — RFC 7636 proof-of-possession validation for
//!   authorization-code exchanges (S256 only).
//! - [`der`] — pure JWK ↔ SubjectPublicKeyInfo PEM conversion; the bit-level
//!   ASN.1 construction is isolated here so it is unit-testable independent
//!   of the HTTP and crypto plumbing around it.
//! - [`jwks_client`] — discovery and caching of signing keys published by
//!   third-party identity providers, so tokens issued outside this process
//!   can also be verified.
//! - [`validation`] — bearer-token validation combining locally issued keys
//!   and externally discovered ones into a normalized claim set.
//! - [`service`] — the authorization-code and refresh-token grant flows
//!   wiring the credential stores, PKCE, and the key manager together.

pub mod der;
pub mod jwks_client;
pub mod keys;
pub mod pkce;
pub mod service;
pub mod validation;

pub use jwks_client::{CacheStats, JwksClient, JwksError, ResolvedKey};
pub use keys::{KeyManager, KeyManagerError};
pub use pkce::PkceError;
pub use service::{AuthService, AuthorizationRequest, TokenResponse};
pub use validation::{TokenValidator, ValidationError};
