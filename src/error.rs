//! Error types for the identity and authorization core.
//!
//! The taxonomy is deliberate:
//!
//! - **Credential errors** collapse into [`Error::InvalidCredentials`] — the
//!   message never reveals whether the client/user existed or which check
//!   failed.
//! - **Token validation errors** are logged with their specific kind at the
//!   validation site but surface outward as the uniform [`Error::InvalidToken`].
//! - **Permission errors** carry a stable machine-readable code and a message
//!   naming what the caller *does* have — denial reasons are not a secrecy
//!   boundary.
//! - **Infrastructure errors** (key-set fetch, discovery) are retryable by the
//!   caller; nothing in this crate auto-retries.

use thiserror::Error;

/// Result type alias for the authorization core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the authorization core.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic credential failure. Covers unknown client/user, bad secret,
    /// and expired/consumed codes or tokens without distinguishing them.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Uniform outward shape for any token validation failure.
    #[error("Invalid token")]
    InvalidToken,

    /// A store entity with the same identifier already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The requested store entity does not exist.
    ///
    /// Used by administrative CRUD, never by credential checks — those
    /// collapse to [`Error::InvalidCredentials`] instead.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No request context is installed on the current task.
    ///
    /// This is a programming-error precondition, distinct from an
    /// unauthenticated request (which is a 401 at the transport boundary).
    #[error("Request context not available")]
    ContextNotAvailable,

    /// The permission engine was not installed in the request context.
    #[error("Permission service not available")]
    ServiceNotAvailable,

    /// The caller's rule set denies the request outright.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The presented token lacks a required scope.
    #[error("Insufficient scope: {0}")]
    InsufficientScope(String),

    /// The target project is outside the caller's allowed patterns.
    #[error("Access denied to project: {0}")]
    ProjectAccessDenied(String),

    /// The tool is not in the caller's allowed set (or is explicitly denied).
    #[error("Access denied to tool: {0}")]
    ToolAccessDenied(String),

    /// A mutating operation was attempted under a read-only rule.
    #[error("Read-only access: {0}")]
    ReadOnlyViolation(String),

    /// OIDC discovery or JWKS fetch failed. Retryable by the caller.
    #[error("Key set resolution failed: {0}")]
    KeySetFetch(String),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code for client-facing permission errors.
    ///
    /// Returns `None` for every other variant so generic error handlers can
    /// tell the 4xx-equivalent denials apart from unexpected failures.
    #[must_use]
    pub fn permission_code(&self) -> Option<&'static str> {
        match self {
            Self::PermissionDenied(_) => Some(codes::PERMISSION_DENIED),
            Self::InsufficientScope(_) => Some(codes::INSUFFICIENT_SCOPE),
            Self::ProjectAccessDenied(_) => Some(codes::PROJECT_ACCESS_DENIED),
            Self::ToolAccessDenied(_) => Some(codes::TOOL_ACCESS_DENIED),
            Self::ReadOnlyViolation(_) => Some(codes::READ_ONLY_VIOLATION),
            _ => None,
        }
    }

    /// Whether this error is the caller's fault (4xx-equivalent).
    ///
    /// Client-facing errors must never be treated as internal failures by a
    /// caller's generic handler.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials
                | Self::InvalidToken
                | Self::PermissionDenied(_)
                | Self::InsufficientScope(_)
                | Self::ProjectAccessDenied(_)
                | Self::ToolAccessDenied(_)
                | Self::ReadOnlyViolation(_)
        )
    }
}

/// Stable permission error codes.
pub mod codes {
    /// The caller's rule set denies the request.
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    /// The token lacks a required scope.
    pub const INSUFFICIENT_SCOPE: &str = "INSUFFICIENT_SCOPE";
    /// The target project is outside the caller's allowed patterns.
    pub const PROJECT_ACCESS_DENIED: &str = "PROJECT_ACCESS_DENIED";
    /// The tool is denied or not allowed for the caller.
    pub const TOOL_ACCESS_DENIED: &str = "TOOL_ACCESS_DENIED";
    /// A write was attempted under a read-only rule.
    pub const READ_ONLY_VIOLATION: &str = "READ_ONLY_VIOLATION";
}
