//! Registered OAuth clients.
//!
//! Secrets are stored only as bcrypt hashes; public clients (PKCE-only) have
//! none. [`ClientStore::validate_credentials`] answers with a plain `bool` —
//! unknown client and no-secret-configured both read as `false` so the
//! response never leaks whether a client id exists.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::{Error, Result};

use super::{BCRYPT_COST, paginate};

/// A registered OAuth client.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    /// Unique client id. Immutable after registration.
    pub client_id: String,
    /// bcrypt hash of the client secret; `None` for public clients.
    pub(crate) secret_hash: Option<String>,
    /// Display name.
    pub name: String,
    /// Exact-match redirect URIs this client may use.
    pub redirect_uris: Vec<String>,
    /// Grant types this client may exercise.
    pub grant_types: Vec<String>,
    /// Scopes this client may request. Empty means unrestricted.
    pub scopes: Vec<String>,
    /// Token-endpoint auth method (`client_secret_post`, `none`, ...).
    pub token_endpoint_auth_method: String,
    /// Registration time. Immutable after registration.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl OAuthClient {
    /// Whether the client authenticates with a secret.
    #[must_use]
    pub fn is_confidential(&self) -> bool {
        self.secret_hash.is_some()
    }
}

/// Input for registering a new client.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistration {
    /// Unique client id.
    pub client_id: String,
    /// Plaintext secret, hashed before storage. `None` for public clients.
    pub secret: Option<String>,
    /// Display name.
    pub name: String,
    /// Allowed redirect URIs.
    pub redirect_uris: Vec<String>,
    /// Allowed grant types.
    pub grant_types: Vec<String>,
    /// Allowed scopes.
    pub scopes: Vec<String>,
    /// Token-endpoint auth method.
    pub token_endpoint_auth_method: String,
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct ClientUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New plaintext secret, re-hashed before storage.
    pub secret: Option<String>,
    /// New redirect URI list.
    pub redirect_uris: Option<Vec<String>>,
    /// New grant type list.
    pub grant_types: Option<Vec<String>>,
    /// New scope list.
    pub scopes: Option<Vec<String>>,
    /// New token-endpoint auth method.
    pub token_endpoint_auth_method: Option<String>,
}

/// In-memory client repository.
#[derive(Default)]
pub struct ClientStore {
    clients: DashMap<String, OAuthClient>,
}

impl ClientStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] when the client id is taken.
    pub fn register(&self, registration: ClientRegistration) -> Result<OAuthClient> {
        if self.clients.contains_key(&registration.client_id) {
            return Err(Error::AlreadyExists(registration.client_id));
        }

        let secret_hash = registration
            .secret
            .as_deref()
            .map(|s| bcrypt::hash(s, BCRYPT_COST))
            .transpose()
            .map_err(|e| Error::Internal(format!("secret hashing failed: {e}")))?;

        let now = Utc::now();
        let client = OAuthClient {
            client_id: registration.client_id.clone(),
            secret_hash,
            name: registration.name,
            redirect_uris: registration.redirect_uris,
            grant_types: registration.grant_types,
            scopes: registration.scopes,
            token_endpoint_auth_method: registration.token_endpoint_auth_method,
            created_at: now,
            updated_at: now,
        };
        self.clients
            .insert(registration.client_id.clone(), client.clone());
        debug!(client_id = %registration.client_id, "Registered OAuth client");
        Ok(client)
    }

    /// Look up a client by id.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<OAuthClient> {
        self.clients.get(client_id).map(|c| c.clone())
    }

    /// Apply a partial update. `client_id` and `created_at` never change.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown client id.
    pub fn update(&self, client_id: &str, update: ClientUpdate) -> Result<OAuthClient> {
        let secret_hash = update
            .secret
            .as_deref()
            .map(|s| bcrypt::hash(s, BCRYPT_COST))
            .transpose()
            .map_err(|e| Error::Internal(format!("secret hashing failed: {e}")))?;

        let mut entry = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| Error::NotFound(client_id.to_string()))?;

        if let Some(name) = update.name {
            entry.name = name;
        }
        if let Some(hash) = secret_hash {
            entry.secret_hash = Some(hash);
        }
        if let Some(uris) = update.redirect_uris {
            entry.redirect_uris = uris;
        }
        if let Some(grants) = update.grant_types {
            entry.grant_types = grants;
        }
        if let Some(scopes) = update.scopes {
            entry.scopes = scopes;
        }
        if let Some(method) = update.token_endpoint_auth_method {
            entry.token_endpoint_auth_method = method;
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Remove a client.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown client id.
    pub fn delete(&self, client_id: &str) -> Result<()> {
        self.clients
            .remove(client_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(client_id.to_string()))
    }

    /// List clients ordered by registration time, paginated.
    #[must_use]
    pub fn list(&self, limit: Option<usize>, offset: Option<usize>) -> Vec<OAuthClient> {
        let mut all: Vec<OAuthClient> = self.clients.iter().map(|c| c.clone()).collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        paginate(all, limit, offset)
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no clients are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Check a presented secret against the stored hash.
    ///
    /// Returns `false` — never an error — for unknown clients and for
    /// clients with no secret configured, so callers cannot distinguish the
    /// cases.
    #[must_use]
    pub fn validate_credentials(&self, client_id: &str, secret: &str) -> bool {
        let Some(client) = self.clients.get(client_id) else {
            return false;
        };
        let Some(hash) = client.secret_hash.as_deref() else {
            return false;
        };
        bcrypt::verify(secret, hash).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registration(client_id: &str, secret: Option<&str>) -> ClientRegistration {
        ClientRegistration {
            client_id: client_id.to_string(),
            secret: secret.map(ToString::to_string),
            name: "Test Client".to_string(),
            redirect_uris: vec!["https://app.example.com/callback".to_string()],
            grant_types: vec!["authorization_code".to_string()],
            scopes: vec!["issues:read".to_string()],
            token_endpoint_auth_method: "client_secret_post".to_string(),
        }
    }

    // ── registration ──────────────────────────────────────────────────────

    #[test]
    fn secret_is_stored_only_as_a_bcrypt_hash() {
        let store = ClientStore::new();
        let client = store.register(registration("web", Some("s3cret"))).unwrap();

        let hash = client.secret_hash.unwrap();
        assert!(hash.starts_with("$2"), "not a bcrypt hash: {hash}");
        assert!(!hash.contains("s3cret"));
    }

    #[test]
    fn duplicate_client_id_is_rejected() {
        let store = ClientStore::new();
        store.register(registration("web", None)).unwrap();
        assert!(matches!(
            store.register(registration("web", None)),
            Err(Error::AlreadyExists(_))
        ));
    }

    // ── credential validation ─────────────────────────────────────────────

    #[test]
    fn correct_secret_validates() {
        let store = ClientStore::new();
        store.register(registration("web", Some("s3cret"))).unwrap();
        assert!(store.validate_credentials("web", "s3cret"));
        assert!(!store.validate_credentials("web", "wrong"));
    }

    #[test]
    fn unknown_client_and_public_client_read_as_false() {
        // Unknown id and no-secret both answer false, not an error
        let store = ClientStore::new();
        store.register(registration("public", None)).unwrap();
        assert!(!store.validate_credentials("missing", "anything"));
        assert!(!store.validate_credentials("public", "anything"));
    }

    // ── updates ───────────────────────────────────────────────────────────

    #[test]
    fn update_preserves_identity_fields() {
        let store = ClientStore::new();
        let created = store.register(registration("web", None)).unwrap();

        let updated = store
            .update(
                "web",
                ClientUpdate {
                    name: Some("Renamed".to_string()),
                    ..ClientUpdate::default()
                },
            )
            .unwrap();

        assert_eq!(updated.client_id, "web");
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.name, "Renamed");
        assert!(updated.updated_at >= created.updated_at);
    }

    #[test]
    fn update_can_set_a_new_secret() {
        let store = ClientStore::new();
        store.register(registration("web", Some("old"))).unwrap();

        store
            .update(
                "web",
                ClientUpdate {
                    secret: Some("new".to_string()),
                    ..ClientUpdate::default()
                },
            )
            .unwrap();

        assert!(store.validate_credentials("web", "new"));
        assert!(!store.validate_credentials("web", "old"));
    }

    #[test]
    fn update_and_delete_of_unknown_client_are_not_found() {
        let store = ClientStore::new();
        assert!(matches!(
            store.update("ghost", ClientUpdate::default()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(store.delete("ghost"), Err(Error::NotFound(_))));
    }

    // ── listing ───────────────────────────────────────────────────────────

    #[test]
    fn listing_is_paginated() {
        let store = ClientStore::new();
        for i in 0..5 {
            store.register(registration(&format!("client-{i}"), None)).unwrap();
        }

        assert_eq!(store.len(), 5);
        assert_eq!(store.list(Some(2), None).len(), 2);
        assert_eq!(store.list(Some(10), Some(3)).len(), 2);
        assert_eq!(store.list(None, None).len(), 5);
    }

    #[test]
    fn delete_removes_the_client() {
        let store = ClientStore::new();
        store.register(registration("web", None)).unwrap();
        store.delete("web").unwrap();
        assert!(store.get("web").is_none());
        assert!(store.is_empty());
    }
}
