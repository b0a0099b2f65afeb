//! Tenant context for request scoping.
//!
//! Two cooperating stores make up the context layer:
//!
//! - [`SessionMarker`]: the session-scoped tenant value a storage connection
//!   carries. The row policy reads it on every access, so a pooled connection
//!   reused across requests without a reset would silently apply the previous
//!   tenant's context. Setting at the start and clearing at the end of every
//!   unit of work is mandatory; `store::TenantSession` is the RAII guard that
//!   guarantees the reset on all exit paths.
//! - [`TenantContext`]: task-local request identity, so resolving a
//!   principal's tenant twice within one unit of work yields the same answer.

use crate::error::Result;
use crate::tenant::{PrincipalId, TenantId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task_local;
use tracing::warn;

// Task-local tenant context for async operations
task_local! {
    static CURRENT_TENANT: TenantContext;
}

/// Session-scoped tenant marker.
///
/// Holds the raw marker string exactly as a storage session would. Reads
/// re-validate on every call and fail closed: a malformed or absent marker
/// resolves to no tenant, hence zero visible rows, never unrestricted access.
#[derive(Debug, Default)]
pub struct SessionMarker {
    raw: Mutex<Option<String>>,
}

impl SessionMarker {
    /// Creates an unset marker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the marker to a validated tenant ID.
    ///
    /// Fails with `InvalidTenant` if the ID is empty or malformed.
    pub fn set(&self, tenant: &TenantId) -> Result<()> {
        TenantId::validate_format(tenant.as_str())?;
        *self.raw.lock() = Some(tenant.as_str().to_string());
        Ok(())
    }

    /// Sets the raw marker string without validation.
    ///
    /// # Warning
    /// Models a marker written by a foreign client on a shared session.
    /// Reads of a malformed raw marker fail closed to no tenant.
    pub fn set_raw(&self, raw: impl Into<String>) {
        *self.raw.lock() = Some(raw.into());
    }

    /// Reads the current tenant, re-validating the stored marker.
    ///
    /// Returns `None` when the marker is unset or malformed.
    pub fn get(&self) -> Option<TenantId> {
        let raw = self.raw.lock().clone()?;
        match TenantId::try_new(raw) {
            Ok(tenant) => Some(tenant),
            Err(e) => {
                warn!(error = %e, "Malformed session tenant marker, failing closed");
                None
            }
        }
    }

    /// Whether a marker value is present (valid or not).
    pub fn is_set(&self) -> bool {
        self.raw.lock().is_some()
    }

    /// Resets the marker to unset.
    pub fn clear(&self) {
        *self.raw.lock() = None;
    }
}

/// Request-scoped tenant context.
#[derive(Debug, Clone)]
pub struct TenantContext {
    /// Resolved tenant ID.
    pub tenant_id: TenantId,
    /// Principal the tenant was resolved from.
    pub principal_id: PrincipalId,
    /// Request ID for audit correlation.
    pub request_id: String,
    /// When the context was established.
    pub established_at: DateTime<Utc>,
}

impl TenantContext {
    /// Creates a new context.
    pub fn new(tenant_id: TenantId, principal_id: PrincipalId) -> Self {
        Self {
            tenant_id,
            principal_id,
            request_id: uuid::Uuid::new_v4().to_string(),
            established_at: Utc::now(),
        }
    }

    /// Sets the request ID.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Runs a future with this tenant context in scope.
    pub async fn scope<F, T>(self, f: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        CURRENT_TENANT.scope(self, f).await
    }

    /// Gets the current tenant context (if in scope).
    pub fn current() -> Option<TenantContext> {
        CURRENT_TENANT.try_with(|ctx| ctx.clone()).ok()
    }

    /// The current context's tenant, if one is in scope for this principal.
    pub fn current_for(principal_id: &PrincipalId) -> Option<TenantId> {
        CURRENT_TENANT
            .try_with(|ctx| {
                if &ctx.principal_id == principal_id {
                    Some(ctx.tenant_id.clone())
                } else {
                    None
                }
            })
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_set_get_clear() {
        let marker = SessionMarker::new();
        assert_eq!(marker.get(), None);

        marker.set(&TenantId::new("t1")).unwrap();
        assert_eq!(marker.get(), Some(TenantId::new("t1")));
        assert!(marker.is_set());

        marker.clear();
        assert_eq!(marker.get(), None);
        assert!(!marker.is_set());
    }

    #[test]
    fn test_marker_rejects_malformed_set() {
        let marker = SessionMarker::new();
        assert!(marker.set(&TenantId::new("")).is_err());
        assert!(marker.set(&TenantId::new("Not Valid")).is_err());
        assert!(!marker.is_set());
    }

    #[test]
    fn test_malformed_raw_marker_fails_closed() {
        let marker = SessionMarker::new();

        marker.set_raw("'; DROP TABLE tenants; --");
        assert!(marker.is_set());
        // Never resolves to a tenant, hence zero visible rows
        assert_eq!(marker.get(), None);

        marker.set_raw("");
        assert_eq!(marker.get(), None);
    }

    #[tokio::test]
    async fn test_task_local_scope() {
        let ctx = TenantContext::new(TenantId::new("t1"), PrincipalId::new("alice"));

        assert!(TenantContext::current().is_none());

        ctx.scope(async {
            let current = TenantContext::current().unwrap();
            assert_eq!(current.tenant_id, TenantId::new("t1"));

            // Resolution within one scope is idempotent
            let first = TenantContext::current_for(&PrincipalId::new("alice"));
            let second = TenantContext::current_for(&PrincipalId::new("alice"));
            assert_eq!(first, second);
            assert_eq!(first, Some(TenantId::new("t1")));

            // A different principal gets nothing from this scope
            assert_eq!(TenantContext::current_for(&PrincipalId::new("bob")), None);
        })
        .await;

        assert!(TenantContext::current().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_scopes_do_not_leak() {
        let t1 = TenantContext::new(TenantId::new("t1"), PrincipalId::new("alice"));
        let t2 = TenantContext::new(TenantId::new("t2"), PrincipalId::new("bob"));

        let a = tokio::spawn(t1.scope(async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            TenantContext::current().unwrap().tenant_id
        }));
        let b = tokio::spawn(t2.scope(async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            TenantContext::current().unwrap().tenant_id
        }));

        assert_eq!(a.await.unwrap(), TenantId::new("t1"));
        assert_eq!(b.await.unwrap(), TenantId::new("t2"));
    }
}
