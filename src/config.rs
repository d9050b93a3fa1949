//! Configuration management

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::permission::PermissionsConfig;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Authorization server configuration
    pub auth: AuthConfig,
    /// Permission rules evaluated per authenticated caller
    pub permissions: PermissionsConfig,
}

/// Authorization server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Issuer URL embedded in locally signed tokens (`iss` claim).
    pub issuer: String,

    /// Resource identifier expected in the `aud` claim of presented tokens.
    pub audience: String,

    /// How long superseded signing keys remain usable for verification.
    #[serde(with = "humantime_serde")]
    pub key_retention: Duration,

    /// Authorization code lifetime.
    #[serde(with = "humantime_serde")]
    pub code_ttl: Duration,

    /// Access token lifetime.
    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,

    /// Refresh token lifetime.
    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,

    /// Sweep interval for expired authorization codes.
    #[serde(with = "humantime_serde")]
    pub code_sweep_interval: Duration,

    /// Sweep interval for expired refresh tokens.
    #[serde(with = "humantime_serde")]
    pub refresh_sweep_interval: Duration,

    /// TTL for cached OIDC discovery documents.
    #[serde(with = "humantime_serde")]
    pub discovery_cache_ttl: Duration,

    /// TTL for cached external key sets.
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:9001".to_string(),
            audience: "quality-gate-mcp".to_string(),
            key_retention: Duration::from_secs(24 * 3600),
            code_ttl: Duration::from_secs(600),
            access_token_ttl: Duration::from_secs(3600),
            refresh_token_ttl: Duration::from_secs(30 * 24 * 3600),
            code_sweep_interval: Duration::from_secs(60),
            refresh_sweep_interval: Duration::from_secs(3600),
            discovery_cache_ttl: Duration::from_secs(24 * 3600),
            jwks_cache_ttl: Duration::from_secs(3600),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (QGATE_ prefix)
        figment = figment.merge(Env::prefixed("QGATE_").split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }
}
