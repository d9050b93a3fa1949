//! Authorization-code and refresh-token grant flows.
//!
//! [`AuthService`] owns the key manager and the four credential stores and
//! wires them into the two lifecycles the stores exist for:
//!
//! - `begin_authorization` → single-use code, optionally PKCE-bound,
//! - `exchange_code` → RS256 access token + rotating refresh token,
//! - `refresh` → rotate the refresh token, mint a new access token,
//! - `revoke_user_sessions` → bulk revocation via the per-user index.
//!
//! Every credential failure surfaces as the uniform
//! [`Error::InvalidCredentials`] — the specific failed check is logged at
//! debug level but never revealed to the caller, so an attacker cannot
//! probe which of client id, secret, code, redirect URI, or verifier was
//! wrong.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rand::RngCore;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::store::{AuthorizationCode, ClientStore, CodeStore, RefreshToken, RefreshTokenStore, UserStore};
use crate::{Error, Result};

use super::keys::KeyManager;
use super::pkce;

/// An authorization request accepted at the authorize endpoint.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Requesting client.
    pub client_id: String,
    /// Redirect URI; must be registered for the client.
    pub redirect_uri: String,
    /// Authenticated user granting the authorization.
    pub user_id: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// PKCE challenge, when the client binds one.
    pub code_challenge: Option<String>,
    /// PKCE challenge method; only `S256` is accepted.
    pub code_challenge_method: Option<String>,
}

/// Token-endpoint response for both grant flows.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    /// Signed RS256 access token.
    pub access_token: String,
    /// Always `Bearer`.
    pub token_type: String,
    /// Access-token lifetime in seconds.
    pub expires_in: u64,
    /// Rotating refresh token.
    pub refresh_token: Option<String>,
    /// Space-delimited granted scopes.
    pub scope: String,
}

/// The embedded authorization server.
pub struct AuthService {
    keys: Arc<KeyManager>,
    clients: Arc<ClientStore>,
    users: Arc<UserStore>,
    codes: Arc<CodeStore>,
    refresh_tokens: Arc<RefreshTokenStore>,
    config: AuthConfig,
}

impl AuthService {
    /// Create the service with fresh stores and a fresh signing key.
    ///
    /// Sweep timers are not started here; call [`AuthService::start_sweepers`]
    /// once the process is ready to run them.
    pub fn new(config: AuthConfig) -> Result<Self> {
        let keys = KeyManager::new(config.key_retention)
            .map_err(|e| Error::Internal(format!("key manager init failed: {e}")))?;
        Ok(Self {
            keys: Arc::new(keys),
            clients: Arc::new(ClientStore::new()),
            users: Arc::new(UserStore::new()),
            codes: Arc::new(CodeStore::new()),
            refresh_tokens: Arc::new(RefreshTokenStore::new()),
            config,
        })
    }

    /// The signing-key manager, shared with the token validator.
    #[must_use]
    pub fn key_manager(&self) -> Arc<KeyManager> {
        Arc::clone(&self.keys)
    }

    /// The client store.
    #[must_use]
    pub fn clients(&self) -> Arc<ClientStore> {
        Arc::clone(&self.clients)
    }

    /// The user store.
    #[must_use]
    pub fn users(&self) -> Arc<UserStore> {
        Arc::clone(&self.users)
    }

    /// The authorization-code store.
    #[must_use]
    pub fn codes(&self) -> Arc<CodeStore> {
        Arc::clone(&self.codes)
    }

    /// The refresh-token store.
    #[must_use]
    pub fn refresh_tokens(&self) -> Arc<RefreshTokenStore> {
        Arc::clone(&self.refresh_tokens)
    }

    /// Start the expiry sweepers on their configured intervals.
    pub fn start_sweepers(&self) {
        self.codes.start_sweeper(self.config.code_sweep_interval);
        self.refresh_tokens
            .start_sweeper(self.config.refresh_sweep_interval);
    }

    /// Stop the expiry sweepers.
    pub fn shutdown(&self) {
        self.codes.shutdown();
        self.refresh_tokens.shutdown();
    }

    /// Validate an authorization request and mint a single-use code.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCredentials`] on any failed check: unknown client,
    /// unregistered redirect URI, grant type not allowed, scope overreach,
    /// unknown user, or an unusable PKCE challenge.
    pub fn begin_authorization(&self, request: &AuthorizationRequest) -> Result<String> {
        let client = self.clients.get(&request.client_id).ok_or_else(|| {
            debug!(client_id = %request.client_id, "Authorization for unknown client");
            Error::InvalidCredentials
        })?;

        if !client.redirect_uris.iter().any(|u| *u == request.redirect_uri) {
            debug!(client_id = %client.client_id, "Redirect URI not registered");
            return Err(Error::InvalidCredentials);
        }
        if !client.grant_types.iter().any(|g| g == "authorization_code") {
            debug!(client_id = %client.client_id, "Grant type not allowed");
            return Err(Error::InvalidCredentials);
        }
        // An empty registered scope list means unrestricted
        if !client.scopes.is_empty()
            && !request.scopes.iter().all(|s| client.scopes.contains(s))
        {
            debug!(client_id = %client.client_id, "Requested scopes exceed registration");
            return Err(Error::InvalidCredentials);
        }
        if self.users.get(&request.user_id).is_none() {
            debug!("Authorization for unknown user");
            return Err(Error::InvalidCredentials);
        }
        if let Some(method) = request.code_challenge_method.as_deref() {
            if method != "S256" || request.code_challenge.is_none() {
                debug!(method = %method, "Unusable PKCE challenge");
                return Err(Error::InvalidCredentials);
            }
        }

        let now = Utc::now();
        let code = random_token();
        self.codes.insert(AuthorizationCode {
            code: code.clone(),
            client_id: request.client_id.clone(),
            user_id: request.user_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            scopes: request.scopes.clone(),
            code_challenge: request.code_challenge.clone(),
            code_challenge_method: request.code_challenge_method.clone(),
            expires_at: now + to_delta(self.config.code_ttl),
            created_at: now,
        });
        info!(client_id = %request.client_id, "Issued authorization code");
        Ok(code)
    }

    /// Exchange a single-use code for tokens.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCredentials`] on any failed check: client
    /// authentication, unknown/expired/consumed code, client or redirect
    /// mismatch, or PKCE failure. The code is consumed even when a later
    /// check fails — a failed exchange burns the code.
    pub fn exchange_code(
        &self,
        client_id: &str,
        client_secret: Option<&str>,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse> {
        self.authenticate_client(client_id, client_secret)?;

        let grant = self.codes.consume(code).ok_or_else(|| {
            debug!(client_id = %client_id, "Unknown or expired authorization code");
            Error::InvalidCredentials
        })?;
        if grant.client_id != client_id {
            debug!(client_id = %client_id, "Code was issued to a different client");
            return Err(Error::InvalidCredentials);
        }
        if grant.redirect_uri != redirect_uri {
            debug!(client_id = %client_id, "Redirect URI mismatch at exchange");
            return Err(Error::InvalidCredentials);
        }
        if let Some(challenge) = grant.code_challenge.as_deref() {
            let verifier = code_verifier.ok_or_else(|| {
                debug!(client_id = %client_id, "Missing PKCE verifier");
                Error::InvalidCredentials
            })?;
            let method = grant.code_challenge_method.as_deref().unwrap_or("S256");
            pkce::validate(verifier, challenge, method).map_err(|e| {
                debug!(client_id = %client_id, error = %e, "PKCE validation failed");
                Error::InvalidCredentials
            })?;
        }

        info!(client_id = %client_id, user_id = %grant.user_id, "Exchanged authorization code");
        self.issue_tokens(client_id, &grant.user_id, grant.scopes, None)
    }

    /// Rotate a refresh token and mint a new access token.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCredentials`] on client authentication failure, an
    /// absent/expired/revoked token, or a client mismatch.
    pub fn refresh(
        &self,
        client_id: &str,
        client_secret: Option<&str>,
        refresh_token: &str,
    ) -> Result<TokenResponse> {
        self.authenticate_client(client_id, client_secret)?;

        let current = self.refresh_tokens.get(refresh_token).ok_or_else(|| {
            debug!(client_id = %client_id, "Unknown or expired refresh token");
            Error::InvalidCredentials
        })?;
        if current.client_id != client_id {
            debug!(client_id = %client_id, "Refresh token belongs to a different client");
            return Err(Error::InvalidCredentials);
        }

        let rotated = self.refresh_tokens.rotate(
            refresh_token,
            random_token(),
            Some(Utc::now() + to_delta(self.config.refresh_token_ttl)),
        )?;
        info!(client_id = %client_id, user_id = %current.user_id, "Rotated refresh token");
        self.issue_tokens(
            client_id,
            &current.user_id,
            current.scopes,
            Some(rotated.token),
        )
    }

    /// Revoke every refresh token of a user. Returns how many were revoked.
    pub fn revoke_user_sessions(&self, user_id: &str) -> usize {
        self.refresh_tokens.revoke_all_for_user(user_id)
    }

    /// Authenticate a client: confidential clients must present the right
    /// secret, public clients must present none.
    fn authenticate_client(&self, client_id: &str, secret: Option<&str>) -> Result<()> {
        let client = self.clients.get(client_id).ok_or_else(|| {
            debug!(client_id = %client_id, "Unknown client");
            Error::InvalidCredentials
        })?;

        let authenticated = match (client.is_confidential(), secret) {
            (true, Some(secret)) => self.clients.validate_credentials(client_id, secret),
            (true, None) => false,
            (false, None) => true,
            // A public client presenting a secret is a misconfigured caller
            (false, Some(_)) => false,
        };
        if authenticated {
            Ok(())
        } else {
            debug!(client_id = %client_id, "Client authentication failed");
            Err(Error::InvalidCredentials)
        }
    }

    /// Mint the access token (and, for the code flow, the initial refresh
    /// token) for a grant.
    fn issue_tokens(
        &self,
        client_id: &str,
        user_id: &str,
        scopes: Vec<String>,
        rotated_refresh: Option<String>,
    ) -> Result<TokenResponse> {
        let now = Utc::now();
        let groups = self
            .users
            .get(user_id)
            .map(|u| u.groups)
            .unwrap_or_default();
        let scope = scopes.join(" ");

        let claims = serde_json::json!({
            "iss": self.config.issuer,
            "sub": user_id,
            "aud": self.config.audience,
            "exp": (now + to_delta(self.config.access_token_ttl)).timestamp(),
            "iat": now.timestamp(),
            "jti": Uuid::new_v4().to_string(),
            "client_id": client_id,
            "scope": scope,
            "groups": groups,
        });
        let access_token = self
            .keys
            .sign(&claims)
            .map_err(|e| Error::Internal(format!("token signing failed: {e}")))?;

        let refresh_token = match rotated_refresh {
            Some(token) => token,
            None => {
                let token = random_token();
                self.refresh_tokens.insert(RefreshToken {
                    token: token.clone(),
                    client_id: client_id.to_string(),
                    user_id: user_id.to_string(),
                    scopes: scopes.clone(),
                    expires_at: Some(now + to_delta(self.config.refresh_token_ttl)),
                    created_at: now,
                    rotated_from: None,
                });
                token
            }
        };

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_token_ttl.as_secs(),
            refresh_token: Some(refresh_token),
            scope,
        })
    }
}

/// 256-bit random value, base64url without padding.
fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn to_delta(duration: std::time::Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(duration).unwrap_or(chrono::TimeDelta::zero())
}
