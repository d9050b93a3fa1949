//! In-memory credential stores.
//!
//! Four independent repositories back the embedded authorization server:
//! registered OAuth clients, end users, single-use authorization codes, and
//! rotating refresh tokens. All state is volatile — nothing survives a
//! process restart — and each store owns its invariants:
//!
//! - every mutation keeps the store's secondary indexes consistent in the
//!   same operation,
//! - expiry is always checked lazily at read time, so correctness never
//!   depends on a background sweep having run,
//! - the time-bounded stores ([`code`], [`refresh`]) additionally run a
//!   periodic sweep with an explicit [`start_sweeper`](code::CodeStore::start_sweeper)
//!   / [`shutdown`](code::CodeStore::shutdown) lifecycle so tests and process
//!   teardown control the timers deterministically.
//!
//! Hashing is deliberately asymmetric: client secrets and user passwords use
//! bcrypt (adaptive, slow by design), API keys use a plain SHA-256 digest
//! because they must be looked up by recomputing the hash of a presented
//! key — API keys carry their own entropy, passwords do not.

pub mod client;
pub mod code;
pub mod refresh;
pub mod user;

pub use client::{ClientRegistration, ClientStore, ClientUpdate, OAuthClient};
pub use code::{AuthorizationCode, CodeStore};
pub use refresh::{RefreshToken, RefreshTokenStore};
pub use user::{ApiKey, User, UserStore};

/// Page size applied when a list call passes no limit.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// bcrypt cost for client secrets and user passwords.
pub(crate) const BCRYPT_COST: u32 = 12;

/// Apply `limit`/`offset` pagination to an already-ordered listing.
pub(crate) fn paginate<T>(items: Vec<T>, limit: Option<usize>, offset: Option<usize>) -> Vec<T> {
    items
        .into_iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(DEFAULT_PAGE_LIMIT))
        .collect()
}
