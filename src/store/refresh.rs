//! Rotating refresh tokens.
//!
//! Tokens are stored by value with a per-user secondary index for bulk
//! revocation. [`RefreshTokenStore::rotate`] claims the old token before
//! minting its replacement (carrying `rotated_from`), so a token can be
//! rotated exactly once even under concurrent attempts.
//! Expiry is lazy at every read; the hourly sweep only bounds memory, with
//! the same explicit sweeper lifecycle as the code store.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{Error, Result};

/// One issued refresh token.
#[derive(Debug, Clone)]
pub struct RefreshToken {
    /// The unguessable token value.
    pub token: String,
    /// Client the token was issued to.
    pub client_id: String,
    /// User the token authenticates.
    pub user_id: String,
    /// Scopes granted.
    pub scopes: Vec<String>,
    /// Optional hard expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Issue time.
    pub created_at: DateTime<Utc>,
    /// The token this one replaced, when created by rotation.
    pub rotated_from: Option<String>,
}

impl RefreshToken {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// In-memory refresh-token repository.
pub struct RefreshTokenStore {
    tokens: Arc<DashMap<String, RefreshToken>>,
    /// user id → live token values
    user_index: Arc<DashMap<String, Vec<String>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshTokenStore {
    /// Create an empty store. The sweep timer is not started here.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(DashMap::new()),
            user_index: Arc::new(DashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Store a freshly issued token and index it by user.
    pub fn insert(&self, token: RefreshToken) {
        self.user_index
            .entry(token.user_id.clone())
            .or_default()
            .push(token.token.clone());
        self.tokens.insert(token.token.clone(), token);
    }

    /// Look up a token. A stale hit is revoked on the spot and reads as
    /// absent.
    #[must_use]
    pub fn get(&self, token: &str) -> Option<RefreshToken> {
        let entry = self.tokens.get(token)?.clone();
        if entry.is_expired(Utc::now()) {
            self.remove(token);
            return None;
        }
        Some(entry)
    }

    /// Revoke a token. Returns whether it existed.
    pub fn revoke(&self, token: &str) -> bool {
        self.remove(token).is_some()
    }

    /// Rotate `old` into a new token value.
    ///
    /// The new token inherits the old one's client, user, and scopes,
    /// records `rotated_from`, and the old token is revoked in the same
    /// step.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCredentials`] when the old token is absent or
    /// expired — rotation of a revoked token must fail, not silently mint.
    pub fn rotate(
        &self,
        old: &str,
        new_token: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<RefreshToken> {
        // Claiming the old token first makes removal the linearization
        // point: of two racing rotations exactly one sees it.
        let previous = self.remove(old).ok_or(Error::InvalidCredentials)?;
        if previous.is_expired(Utc::now()) {
            return Err(Error::InvalidCredentials);
        }

        let rotated = RefreshToken {
            token: new_token,
            client_id: previous.client_id,
            user_id: previous.user_id,
            scopes: previous.scopes,
            expires_at,
            created_at: Utc::now(),
            rotated_from: Some(old.to_string()),
        };
        self.insert(rotated.clone());
        Ok(rotated)
    }

    /// Revoke every live token of a user, clearing the index entry itself.
    /// Returns how many tokens were revoked.
    pub fn revoke_all_for_user(&self, user_id: &str) -> usize {
        let Some((_, token_values)) = self.user_index.remove(user_id) else {
            return 0;
        };
        let mut revoked = 0;
        for value in token_values {
            if self.tokens.remove(&value).is_some() {
                revoked += 1;
            }
        }
        debug!(user_id = %user_id, revoked, "Revoked all refresh tokens for user");
        revoked
    }

    /// Number of stored tokens (expired-but-unswept included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the store holds no tokens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Start the periodic expiry sweep. Replaces a previously started
    /// sweeper.
    pub fn start_sweeper(&self, interval: Duration) {
        let tokens = Arc::downgrade(&self.tokens);
        let user_index = Arc::downgrade(&self.user_index);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                let (Some(tokens), Some(user_index)) =
                    (Weak::upgrade(&tokens), Weak::upgrade(&user_index))
                else {
                    break;
                };
                sweep(&tokens, &user_index);
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the sweep timer. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Remove a token and its user-index entry.
    fn remove(&self, token: &str) -> Option<RefreshToken> {
        let (_, entry) = self.tokens.remove(token)?;
        if let Some(mut values) = self.user_index.get_mut(&entry.user_id) {
            values.retain(|v| v != token);
            let empty = values.is_empty();
            drop(values);
            if empty {
                self.user_index
                    .remove_if(&entry.user_id, |_, v| v.is_empty());
            }
        }
        Some(entry)
    }
}

impl Default for RefreshTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RefreshTokenStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep(tokens: &DashMap<String, RefreshToken>, user_index: &DashMap<String, Vec<String>>) {
    let now = Utc::now();
    let stale: Vec<String> = tokens
        .iter()
        .filter(|t| t.is_expired(now))
        .map(|t| t.token.clone())
        .collect();
    for token in &stale {
        if let Some((_, entry)) = tokens.remove(token) {
            if let Some(mut values) = user_index.get_mut(&entry.user_id) {
                values.retain(|v| v != token);
            }
        }
    }
    user_index.retain(|_, values| !values.is_empty());
    if !stale.is_empty() {
        debug!(removed = stale.len(), "Swept expired refresh tokens");
    }
}
