//! Request-scoped identity propagation.
//!
//! The verified identity of the current request (plus the process's
//! permission engine handle) is stored in a `tokio::task_local!` slot, scoped
//! to the single asynchronous call chain of one inbound request. Two in-flight
//! requests never observe each other's identity, and nothing leaks once the
//! scope future completes — there is no process-wide mutable state here.
//!
//! # Accessors
//!
//! - [`identity`] returns `None` outside a scope — for call sites that can
//!   degrade gracefully.
//! - [`identity_or_err`] / [`permissions_or_err`] assert the precondition
//!   instead, so business logic deep in a handler does not have to thread an
//!   optional context through every signature. The errors they raise
//!   ([`Error::ContextNotAvailable`], [`Error::ServiceNotAvailable`]) are
//!   internal preconditions, distinct from an unauthenticated request.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::permission::PermissionEngine;
use crate::{Error, Result};

/// Verified caller identity for the lifetime of one request.
///
/// Produced by token validation; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityContext {
    /// Subject (user id) from the verified token.
    pub user_id: String,
    /// Group memberships.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Issuer URL of the verifying authority.
    pub issuer: String,
    /// The full normalized claim set, for callers that need extra claims.
    pub claims: serde_json::Value,
}

impl IdentityContext {
    /// Whether the identity carries the given scope.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Require a scope, for handlers gating on token grants.
    ///
    /// # Errors
    ///
    /// [`Error::InsufficientScope`] naming the missing scope.
    pub fn require_scope(&self, scope: &str) -> Result<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(Error::InsufficientScope(scope.to_string()))
        }
    }
}

/// Everything installed on the task for one request.
#[derive(Clone)]
pub struct RequestScope {
    /// The verified caller.
    pub identity: IdentityContext,
    /// The process's permission engine, if one is configured.
    pub permissions: Option<Arc<PermissionEngine>>,
}

tokio::task_local! {
    /// Task-local slot for the current request's scope.
    ///
    /// Set by [`with_request_scope`]; read by the accessors below.
    static REQUEST_SCOPE: RequestScope;
}

/// Run `future` with `scope` installed as the current request scope.
///
/// Any accessor call from within `future` (or futures it awaits) sees this
/// scope; after `future` completes the slot is empty again.
pub async fn with_request_scope<F, T>(scope: RequestScope, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    REQUEST_SCOPE.scope(scope, future).await
}

/// The identity of the current request, or `None` when no scope is installed.
#[must_use]
pub fn identity() -> Option<IdentityContext> {
    REQUEST_SCOPE.try_with(|s| s.identity.clone()).ok()
}

/// The identity of the current request.
///
/// # Errors
///
/// [`Error::ContextNotAvailable`] when no request is in flight on this task
/// or the request was never authenticated.
pub fn identity_or_err() -> Result<IdentityContext> {
    identity().ok_or(Error::ContextNotAvailable)
}

/// The permission engine installed for the current request.
///
/// # Errors
///
/// [`Error::ContextNotAvailable`] when no scope is installed;
/// [`Error::ServiceNotAvailable`] when the scope carries no engine.
pub fn permissions_or_err() -> Result<Arc<PermissionEngine>> {
    let engine = REQUEST_SCOPE
        .try_with(|s| s.permissions.clone())
        .map_err(|_| Error::ContextNotAvailable)?;
    engine.ok_or(Error::ServiceNotAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::PermissionsConfig;

    fn make_identity(user_id: &str) -> IdentityContext {
        IdentityContext {
            user_id: user_id.to_string(),
            groups: vec!["developers".to_string()],
            scopes: vec!["issues:read".to_string()],
            issuer: "http://localhost:9001".to_string(),
            claims: serde_json::json!({"sub": user_id}),
        }
    }

    fn make_scope(user_id: &str) -> RequestScope {
        RequestScope {
            identity: make_identity(user_id),
            permissions: Some(Arc::new(PermissionEngine::new(
                PermissionsConfig::default(),
            ))),
        }
    }

    // ── identity ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn identity_returns_none_outside_scope() {
        assert!(identity().is_none());
    }

    #[tokio::test]
    async fn identity_returns_caller_inside_scope() {
        let found = with_request_scope(make_scope("alice"), async { identity() }).await;
        assert_eq!(found.unwrap().user_id, "alice");
    }

    #[tokio::test]
    async fn identity_is_cleared_after_scope_exits() {
        with_request_scope(make_scope("alice"), async {}).await;
        assert!(identity().is_none());
    }

    // ── or-err accessors ──────────────────────────────────────────────────

    #[tokio::test]
    async fn identity_or_err_raises_context_not_available() {
        let err = identity_or_err().unwrap_err();
        assert!(matches!(err, Error::ContextNotAvailable));
    }

    #[tokio::test]
    async fn permissions_or_err_raises_service_not_available_without_engine() {
        let scope = RequestScope {
            identity: make_identity("alice"),
            permissions: None,
        };
        let err = with_request_scope(scope, async { permissions_or_err() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotAvailable));
    }

    #[tokio::test]
    async fn permissions_or_err_returns_engine_inside_scope() {
        let result = with_request_scope(make_scope("alice"), async { permissions_or_err() }).await;
        assert!(result.is_ok());
    }

    // ── isolation ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn concurrent_requests_see_their_own_identity() {
        // GIVEN: two concurrently running request scopes
        let a = tokio::spawn(with_request_scope(make_scope("alice"), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            identity().map(|i| i.user_id)
        }));
        let b = tokio::spawn(with_request_scope(make_scope("bob"), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            identity().map(|i| i.user_id)
        }));

        // THEN: each task observes only its own caller
        assert_eq!(a.await.unwrap().as_deref(), Some("alice"));
        assert_eq!(b.await.unwrap().as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn nested_scope_shadows_outer_scope() {
        let result = with_request_scope(make_scope("outer"), async {
            let outer = identity().map(|i| i.user_id);
            let inner = with_request_scope(make_scope("inner"), async {
                identity().map(|i| i.user_id)
            })
            .await;
            (outer, inner)
        })
        .await;
        assert_eq!(result.0.as_deref(), Some("outer"));
        assert_eq!(result.1.as_deref(), Some("inner"));
    }
}
