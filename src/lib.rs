//! Identity and authorization core for a code-quality inspection MCP backend.
//!
//! The crate bundles two tightly coupled subsystems:
//!
//! - **Embedded OAuth2/OIDC authorization server**: RSA signing-key lifecycle,
//!   PKCE, in-memory credential stores (clients, users, authorization codes,
//!   refresh tokens), external key resolution for third-party issuers, and
//!   bearer-token validation.
//! - **Permission engine**: per-caller rule evaluation deciding tool access,
//!   project access (pattern matching), and post-hoc filtering of result
//!   collections (projects, issues, hotspots).
//!
//! Transport framing, the upstream code-quality API client, and the domain
//! tool handlers live outside this crate; they feed a bearer token in and get
//! an allow/deny decision (plus optionally filtered data) back.
//!
//! # Non-goals
//!
//! All stores are volatile and single-process: no persistence across
//! restarts, no clustering. RS256 is the only supported signature algorithm.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod permission;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
