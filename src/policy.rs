//! Row-level tenant policy.
//!
//! The last line of defense, enforced inside the storage engine itself and
//! independent of application correctness: a row is visible or writable only
//! when its tenant column equals the tenant carried by the session marker.
//!
//! Which entity types are tenant-scoped is declared at compile time by
//! implementing [`TenantScoped`]; there is no runtime probing for a tenant
//! attribute, so a table without the column cannot be registered at all. A
//! *row* whose tenant value is absent (legacy data written before the column
//! was backfilled) is a schema defect: it is withheld from every result and
//! reported to operators, never silently served.

use crate::tenant::TenantId;
use crate::types::RecordId;

/// Compile-time capability marker for tenant-scoped entity types.
///
/// Every entity stored in a policy-enforced [`crate::store::Table`] must
/// implement this trait. Domain resource handlers supply only their own
/// filtering and validation on top and never re-implement tenant checks.
pub trait TenantScoped: Clone + Send + Sync + 'static {
    /// Resource name used in audit events and diagnostics.
    const RESOURCE: &'static str;

    /// The record's unique identifier.
    fn record_id(&self) -> &RecordId;

    /// The tenant column value.
    ///
    /// `None` marks a defective row (missing tenant value), which the policy
    /// reports and withholds.
    fn tenant_id(&self) -> Option<&TenantId>;

    /// Stamps the tenant column. Called exactly once by the access guard at
    /// creation time; the value is immutable afterwards.
    fn assign_tenant(&mut self, tenant: TenantId);
}

/// Outcome of evaluating the row policy for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Row belongs to the session tenant.
    Visible,
    /// Row is invisible to the session (other tenant, or no session tenant).
    Hidden,
    /// Row has no tenant value: a defect, withheld and reported.
    SchemaDefect,
}

/// Declarative per-row tenant filter.
///
/// Keyed off the session marker: no marker, or a malformed one, yields no
/// tenant and therefore zero visible rows. There is no code path from an
/// unreadable marker to unrestricted access.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowPolicy;

impl RowPolicy {
    /// Evaluates the policy for a single row against the session tenant.
    pub fn evaluate<R: TenantScoped>(
        session_tenant: Option<&TenantId>,
        row: &R,
    ) -> PolicyDecision {
        let Some(session) = session_tenant else {
            // Fail closed: unresolved session sees nothing.
            return PolicyDecision::Hidden;
        };

        match row.tenant_id() {
            None => PolicyDecision::SchemaDefect,
            Some(owner) if owner == session => PolicyDecision::Visible,
            Some(_) => PolicyDecision::Hidden,
        }
    }

    /// Whether a new row may be written under the session tenant.
    ///
    /// Identical rule to reads: the row must carry exactly the session tenant.
    pub fn writable<R: TenantScoped>(session_tenant: Option<&TenantId>, row: &R) -> PolicyDecision {
        Self::evaluate(session_tenant, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Doc {
        id: RecordId,
        tenant: Option<TenantId>,
    }

    impl TenantScoped for Doc {
        const RESOURCE: &'static str = "docs";

        fn record_id(&self) -> &RecordId {
            &self.id
        }

        fn tenant_id(&self) -> Option<&TenantId> {
            self.tenant.as_ref()
        }

        fn assign_tenant(&mut self, tenant: TenantId) {
            self.tenant = Some(tenant);
        }
    }

    fn doc(tenant: Option<&str>) -> Doc {
        Doc {
            id: RecordId::generate(),
            tenant: tenant.map(TenantId::new),
        }
    }

    #[test]
    fn test_matching_tenant_is_visible() {
        let session = TenantId::new("t1");
        assert_eq!(
            RowPolicy::evaluate(Some(&session), &doc(Some("t1"))),
            PolicyDecision::Visible
        );
    }

    #[test]
    fn test_other_tenant_is_hidden() {
        let session = TenantId::new("t1");
        assert_eq!(
            RowPolicy::evaluate(Some(&session), &doc(Some("t2"))),
            PolicyDecision::Hidden
        );
    }

    #[test]
    fn test_no_session_fails_closed() {
        // Even the row's own tenant is hidden without a session marker
        assert_eq!(
            RowPolicy::evaluate(None, &doc(Some("t1"))),
            PolicyDecision::Hidden
        );
        assert_eq!(RowPolicy::evaluate(None, &doc(None)), PolicyDecision::Hidden);
    }

    #[test]
    fn test_missing_tenant_value_is_defect() {
        let session = TenantId::new("t1");
        assert_eq!(
            RowPolicy::evaluate(Some(&session), &doc(None)),
            PolicyDecision::SchemaDefect
        );
    }
}
