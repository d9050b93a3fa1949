//! End users, passwords, and API keys.
//!
//! Two secondary indexes hang off the user map and every mutation keeps them
//! consistent in the same operation:
//!
//! - a case-insensitive email index (lowercased email → user id),
//! - an API-key index (SHA-256 hex of the presented key → user id + key id).
//!
//! Passwords are bcrypt-hashed; API keys use the fast SHA-256 digest because
//! [`UserStore::find_by_api_key`] must recompute the hash of a presented key
//! and probe the index. Deleting a user cascades its API keys out of the
//! index.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::{Error, Result};

use super::{BCRYPT_COST, paginate};

/// Prefix on generated API keys, so leaked keys are recognizable in scans.
const API_KEY_PREFIX: &str = "qg_";

/// An API key attached to a user. The plaintext is returned exactly once,
/// at creation; only the digest is retained.
#[derive(Debug, Clone)]
pub struct ApiKey {
    /// Key id, for management operations.
    pub id: String,
    /// Display name.
    pub name: String,
    /// SHA-256 hex digest of the plaintext key.
    pub(crate) key_hash: String,
    /// Scopes granted to this key.
    pub scopes: Vec<String>,
    /// Optional expiry; expired keys stop resolving.
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful lookup via this key.
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A registered user.
#[derive(Debug, Clone)]
pub struct User {
    /// Unique user id.
    pub id: String,
    /// Email, unique case-insensitively.
    pub email: String,
    /// bcrypt hash of the password.
    pub(crate) password_hash: String,
    /// Group memberships, consumed by the permission engine.
    pub groups: Vec<String>,
    /// API keys owned by this user.
    pub api_keys: Vec<ApiKey>,
    /// Inactive users fail password and API-key checks.
    pub active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Last recorded login.
    pub last_login_at: Option<DateTime<Utc>>,
}

/// In-memory user repository.
#[derive(Default)]
pub struct UserStore {
    users: DashMap<String, User>,
    /// lowercased email → user id
    email_index: DashMap<String, String>,
    /// SHA-256 hex of the key → (user id, key id)
    api_key_index: DashMap<String, (String, String)>,
}

impl UserStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a user with a fresh id, hashing the password.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] when the email is already registered
    /// (case-insensitively).
    pub fn create(&self, email: &str, password: &str, groups: Vec<String>) -> Result<User> {
        let email_key = email.to_lowercase();
        if self.email_index.contains_key(&email_key) {
            return Err(Error::AlreadyExists(email_key));
        }

        let password_hash = bcrypt::hash(password, BCRYPT_COST)
            .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))?;
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            password_hash,
            groups,
            api_keys: Vec::new(),
            active: true,
            created_at: now,
            updated_at: now,
            last_login_at: None,
        };

        self.email_index.insert(email_key, user.id.clone());
        self.users.insert(user.id.clone(), user.clone());
        debug!(user_id = %user.id, "Created user");
        Ok(user)
    }

    /// Look up a user by id.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<User> {
        self.users.get(user_id).map(|u| u.clone())
    }

    /// Look up a user by email, case-insensitively.
    #[must_use]
    pub fn find_by_email(&self, email: &str) -> Option<User> {
        let user_id = self.email_index.get(&email.to_lowercase())?.clone();
        self.get(&user_id)
    }

    /// Change a user's email, keeping the email index consistent.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown user, [`Error::AlreadyExists`] when
    /// the new email belongs to another user.
    pub fn update_email(&self, user_id: &str, new_email: &str) -> Result<User> {
        let new_key = new_email.to_lowercase();
        if let Some(owner) = self.email_index.get(&new_key) {
            if *owner != user_id {
                return Err(Error::AlreadyExists(new_key));
            }
        }

        let mut entry = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;

        self.email_index.remove(&entry.email.to_lowercase());
        self.email_index.insert(new_key, user_id.to_string());
        entry.email = new_email.to_string();
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Replace a user's group memberships.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown user.
    pub fn update_groups(&self, user_id: &str, groups: Vec<String>) -> Result<User> {
        let mut entry = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;
        entry.groups = groups;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Activate or deactivate a user.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown user.
    pub fn set_active(&self, user_id: &str, active: bool) -> Result<User> {
        let mut entry = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;
        entry.active = active;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Delete a user, cascading its email and API keys out of the indexes.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown user.
    pub fn delete(&self, user_id: &str) -> Result<()> {
        let (_, user) = self
            .users
            .remove(user_id)
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;

        self.email_index.remove(&user.email.to_lowercase());
        for key in &user.api_keys {
            self.api_key_index.remove(&key.key_hash);
        }
        debug!(user_id = %user_id, api_keys = user.api_keys.len(), "Deleted user");
        Ok(())
    }

    /// List users ordered by creation time, paginated.
    #[must_use]
    pub fn list(&self, limit: Option<usize>, offset: Option<usize>) -> Vec<User> {
        let mut all: Vec<User> = self.users.iter().map(|u| u.clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        paginate(all, limit, offset)
    }

    /// Number of users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Check a password against the stored bcrypt hash.
    ///
    /// `false` for unknown and inactive users alike.
    #[must_use]
    pub fn verify_password(&self, user_id: &str, password: &str) -> bool {
        let Some(user) = self.users.get(user_id) else {
            return false;
        };
        if !user.active {
            return false;
        }
        bcrypt::verify(password, &user.password_hash).unwrap_or(false)
    }

    /// Mint a new API key for a user. Returns the key record and the
    /// plaintext — the only time the plaintext is available.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown user.
    pub fn add_api_key(
        &self,
        user_id: &str,
        name: &str,
        scopes: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(ApiKey, String)> {
        let mut entry = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;

        let plaintext = generate_api_key();
        let key = ApiKey {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            key_hash: digest_api_key(&plaintext),
            scopes,
            expires_at,
            created_at: Utc::now(),
            last_used_at: None,
        };

        self.api_key_index
            .insert(key.key_hash.clone(), (user_id.to_string(), key.id.clone()));
        entry.api_keys.push(key.clone());
        entry.updated_at = Utc::now();
        Ok((key, plaintext))
    }

    /// Remove an API key from a user and from the lookup index.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown user or key id.
    pub fn remove_api_key(&self, user_id: &str, key_id: &str) -> Result<()> {
        let mut entry = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;

        let position = entry
            .api_keys
            .iter()
            .position(|k| k.id == key_id)
            .ok_or_else(|| Error::NotFound(key_id.to_string()))?;
        let key = entry.api_keys.remove(position);
        entry.updated_at = Utc::now();
        self.api_key_index.remove(&key.key_hash);
        Ok(())
    }

    /// Resolve a presented API key to its user.
    ///
    /// Recomputes the digest, probes the index, honors key expiry and the
    /// user's active flag, and bumps the key's `last_used_at` on success.
    #[must_use]
    pub fn find_by_api_key(&self, presented: &str) -> Option<User> {
        let (user_id, key_id) = self.api_key_index.get(&digest_api_key(presented))?.clone();

        let mut entry = self.users.get_mut(&user_id)?;
        if !entry.active {
            return None;
        }
        let now = Utc::now();
        {
            let key = entry.api_keys.iter_mut().find(|k| k.id == key_id)?;
            if key.expires_at.is_some_and(|exp| exp <= now) {
                return None;
            }
            key.last_used_at = Some(now);
        }
        Some(entry.clone())
    }

    /// Record a successful login.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown user.
    pub fn record_login(&self, user_id: &str) -> Result<()> {
        let mut entry = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;
        entry.last_login_at = Some(Utc::now());
        Ok(())
    }
}

/// 256-bit random API key, base64url, with a recognizable prefix.
fn generate_api_key() -> String {
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Fast deterministic digest used for the lookup index.
fn digest_api_key(presented: &str) -> String {
    hex::encode(Sha256::digest(presented.as_bytes()))
}
