//! Single-use authorization codes.
//!
//! Codes bind an authorization grant to a client, a user, a redirect URI,
//! and optionally a PKCE challenge. They are strictly single-use:
//! [`CodeStore::consume`] removes the code as it returns it, and a consumed
//! or expired code behaves exactly like one that never existed.
//!
//! Expiry is enforced lazily at every read; the periodic sweep only bounds
//! memory. The sweeper is an explicit lifecycle ([`CodeStore::start_sweeper`]
//! / [`CodeStore::shutdown`]) so tests and process teardown control it; the
//! sweep task holds only a weak reference and exits on its own once the
//! store is dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// One issued authorization code.
#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    /// The unguessable code value.
    pub code: String,
    /// Client the code was issued to.
    pub client_id: String,
    /// User who granted the authorization.
    pub user_id: String,
    /// Redirect URI used in the authorization request; must match at
    /// exchange.
    pub redirect_uri: String,
    /// Scopes granted.
    pub scopes: Vec<String>,
    /// PKCE challenge, when the client bound one.
    pub code_challenge: Option<String>,
    /// PKCE challenge method (`S256`).
    pub code_challenge_method: Option<String>,
    /// Hard expiry; expired codes are treated as absent.
    pub expires_at: DateTime<Utc>,
    /// Issue time.
    pub created_at: DateTime<Utc>,
}

impl AuthorizationCode {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// In-memory authorization-code repository.
pub struct CodeStore {
    codes: Arc<DashMap<String, AuthorizationCode>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CodeStore {
    /// Create an empty store. The sweep timer is not started here.
    #[must_use]
    pub fn new() -> Self {
        Self {
            codes: Arc::new(DashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Store a freshly issued code.
    pub fn insert(&self, code: AuthorizationCode) {
        self.codes.insert(code.code.clone(), code);
    }

    /// Look up a code without consuming it.
    ///
    /// A stale hit is deleted on the spot and reads as absent.
    #[must_use]
    pub fn get(&self, code: &str) -> Option<AuthorizationCode> {
        let entry = self.codes.get(code)?.clone();
        if entry.is_expired(Utc::now()) {
            self.codes.remove(code);
            return None;
        }
        Some(entry)
    }

    /// Consume a code: remove it and return it, once.
    ///
    /// Expired codes are removed and read as absent, identical to a code
    /// that never existed.
    #[must_use]
    pub fn consume(&self, code: &str) -> Option<AuthorizationCode> {
        let (_, entry) = self.codes.remove(code)?;
        if entry.is_expired(Utc::now()) {
            return None;
        }
        Some(entry)
    }

    /// Number of stored codes (expired-but-unswept included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Whether the store holds no codes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Start the periodic expiry sweep. Replaces a previously started
    /// sweeper.
    pub fn start_sweeper(&self, interval: Duration) {
        let codes = Arc::downgrade(&self.codes);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                let Some(codes) = Weak::upgrade(&codes) else {
                    break;
                };
                sweep(&codes);
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
}

impl Default for CodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CodeStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep(codes: &DashMap<String, AuthorizationCode>) {
    let now = Utc::now();
    let before = codes.len();
    codes.retain(|_, code| !code.is_expired(now));
    let removed = before - codes.len();
    if removed > 0 {
        debug!(removed, "Swept expired authorization codes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn code(value: &str, ttl_secs: i64) -> AuthorizationCode {
        AuthorizationCode {
            code: value.to_string(),
            client_id: "web".to_string(),
            user_id: "alice".to_string(),
            redirect_uri: "https://app.example.com/callback".to_string(),
            scopes: vec!["issues:read".to_string()],
            code_challenge: None,
            code_challenge_method: None,
            expires_at: Utc::now() + chrono::TimeDelta::seconds(ttl_secs),
            created_at: Utc::now(),
        }
    }

    // ── single use ────────────────────────────────────────────────────────

    #[test]
    fn consume_returns_the_code_exactly_once() {
        let store = CodeStore::new();
        store.insert(code("abc", 600));

        assert!(store.consume("abc").is_some());
        assert!(store.consume("abc").is_none());
        assert!(store.get("abc").is_none());
    }

    #[test]
    fn unknown_code_reads_as_absent() {
        let store = CodeStore::new();
        assert!(store.get("ghost").is_none());
        assert!(store.consume("ghost").is_none());
    }

    // ── lazy expiry ───────────────────────────────────────────────────────

    #[test]
    fn stale_hit_is_deleted_and_reads_as_absent() {
        let store = CodeStore::new();
        store.insert(code("stale", -1));

        assert!(store.get("stale").is_none());
        // The lazy check already removed it
        assert!(store.is_empty());
    }

    #[test]
    fn consuming_an_expired_code_fails_and_removes_it() {
        let store = CodeStore::new();
        store.insert(code("stale", -1));

        assert!(store.consume("stale").is_none());
        assert!(store.is_empty());
    }

    // ── sweeper ───────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_codes_on_its_interval() {
        let store = CodeStore::new();
        store.insert(code("stale", -1));
        store.insert(code("fresh", 600));
        store.start_sweeper(Duration::from_secs(60));
        // Let the sweeper task start and register its interval timer
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        // Let the sweep task run
        tokio::task::yield_now().await;

        assert_eq!(store.len(), 1);
        assert!(store.get("fresh").is_some());
        store.shutdown();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let store = CodeStore::new();
        store.start_sweeper(Duration::from_secs(60));
        store.shutdown();
        store.shutdown();
    }

    #[tokio::test]
    async fn sweeper_exits_when_the_store_is_dropped() {
        let store = CodeStore::new();
        store.start_sweeper(Duration::from_secs(1));
        let weak = Arc::downgrade(&store.codes);
        drop(store);
        assert!(weak.upgrade().is_none());
    }
}
