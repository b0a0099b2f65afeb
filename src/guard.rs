//! The access guard: the single enforcement surface for tenant-scoped data.
//!
//! Every application-facing operation goes through a guard. The guard
//! resolves the principal's tenant, opens a pooled connection under a
//! tenant session, and delegates to the policy-enforced table. Reads fail
//! closed to empty results when no tenant can be resolved; writes fail with
//! an explicit error and nothing touches the store. Every blocked attempt is
//! reported to the violation detector before the error is returned.

use crate::audit::{SecurityEvent, SecurityEventKind};
use crate::context::TenantContext;
use crate::detect::ViolationDetector;
use crate::error::{BulkheadError, Result};
use crate::observability::{record_guard_op, record_violation};
use crate::policy::TenantScoped;
use crate::store::{ConnectionPool, Lookup, Table, TenantSession};
use crate::tenant::{Principal, TenantId};
use crate::types::{Operation, RecordId};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Per-resource behavior layered on top of tenant enforcement.
///
/// Handlers compose with the guard rather than replacing any of it: they
/// can only narrow what the policy already allows, never widen it. The
/// defaults make every method optional.
pub trait ResourceHandler<R: TenantScoped>: Send + Sync {
    /// Extra visibility predicate applied after the row policy.
    fn base_filter(&self, _record: &R) -> bool {
        true
    }

    /// Domain validation run before any write is attempted.
    fn validate(&self, _record: &R) -> Result<()> {
        Ok(())
    }
}

/// Handler with no resource-specific behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

impl<R: TenantScoped> ResourceHandler<R> for DefaultHandler {}

/// Tenant-enforcing front door for one resource table.
pub struct AccessGuard<R: TenantScoped, H: ResourceHandler<R>> {
    table: Arc<Table<R>>,
    pool: Arc<ConnectionPool>,
    handler: H,
    detector: Arc<ViolationDetector>,
}

impl<R: TenantScoped, H: ResourceHandler<R>> AccessGuard<R, H> {
    /// Creates a guard over a table.
    pub fn new(
        table: Arc<Table<R>>,
        pool: Arc<ConnectionPool>,
        handler: H,
        detector: Arc<ViolationDetector>,
    ) -> Self {
        Self {
            table,
            pool,
            handler,
            detector,
        }
    }

    /// Resolves the tenant a unit of work executes under.
    ///
    /// An already-established task-local context wins, so resolution is
    /// idempotent within a unit of work. Otherwise the tenant comes from the
    /// principal's association and is re-validated. A principal with no
    /// resolvable tenant is reported and refused.
    pub fn resolve_tenant(&self, principal: &Principal, operation: Operation) -> Result<TenantId> {
        if let Some(tenant) = TenantContext::current_for(&principal.id) {
            return Ok(tenant);
        }

        match &principal.tenant {
            Some(tenant) => match TenantId::validate_format(tenant.as_str()) {
                Ok(()) => Ok(tenant.clone()),
                Err(_) => {
                    self.report_no_context(principal, operation, "malformed tenant association");
                    Err(BulkheadError::NoTenantContext(format!(
                        "principal {} has a malformed tenant association",
                        principal.id
                    )))
                }
            },
            None => {
                self.report_no_context(principal, operation, "no tenant association");
                Err(BulkheadError::NoTenantContext(format!(
                    "principal {} has no tenant association",
                    principal.id
                )))
            }
        }
    }

    /// Lists the rows visible to the principal's tenant.
    ///
    /// A principal with no resolvable tenant sees an empty result, not an
    /// error and never an unfiltered one.
    pub async fn list(&self, principal: &Principal) -> Result<Vec<R>> {
        self.list_where(principal, |_| true).await
    }

    /// Lists visible rows matching an additional caller-supplied filter.
    ///
    /// The filter only ever narrows the tenant-scoped result.
    pub async fn list_where<F>(&self, principal: &Principal, filter: F) -> Result<Vec<R>>
    where
        F: Fn(&R) -> bool,
    {
        let tenant = match self.resolve_tenant(principal, Operation::List) {
            Ok(tenant) => tenant,
            Err(e) if e.is_access_denial() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let conn = self.pool.acquire().await?;
        let session = TenantSession::begin(conn, &tenant)?;
        let scan = self
            .table
            .scan(session.connection(), |r| {
                self.handler.base_filter(r) && filter(r)
            })
            .await;
        drop(session);

        self.report_defects(principal, Operation::List, &tenant, &scan.defects);
        self.detector
            .observe_fetch(principal, &tenant, R::RESOURCE, scan.rows.len() as u64);
        record_guard_op(R::RESOURCE, Operation::List);

        Ok(scan.rows)
    }

    /// Fetches one row if it is visible to the principal's tenant.
    ///
    /// Hidden, defective, and missing rows are indistinguishable from the
    /// caller's side.
    pub async fn get(&self, principal: &Principal, id: &RecordId) -> Result<Option<R>> {
        let tenant = match self.resolve_tenant(principal, Operation::Get) {
            Ok(tenant) => tenant,
            Err(e) if e.is_access_denial() => return Ok(None),
            Err(e) => return Err(e),
        };

        let conn = self.pool.acquire().await?;
        let session = TenantSession::begin(conn, &tenant)?;
        let lookup = self.table.lookup(session.connection(), id).await;
        drop(session);

        if matches!(lookup, Lookup::Defect) {
            self.report_defects(principal, Operation::Get, &tenant, std::slice::from_ref(id));
        }

        record_guard_op(R::RESOURCE, Operation::Get);

        match lookup.into_visible() {
            Some(row) if self.handler.base_filter(&row) => {
                self.detector.observe_fetch(principal, &tenant, R::RESOURCE, 1);
                Ok(Some(row))
            }
            _ => Ok(None),
        }
    }

    /// Creates a row under the principal's tenant.
    ///
    /// The tenant value is stamped server-side from the resolved tenant. A
    /// payload carrying a different tenant is a cross-tenant attempt: it is
    /// reported and refused before anything is written.
    pub async fn create(&self, principal: &Principal, mut record: R) -> Result<R> {
        let tenant = self.resolve_tenant(principal, Operation::Create)?;
        self.handler.validate(&record)?;

        if let Some(requested) = record.tenant_id() {
            if requested != &tenant {
                let requested = requested.clone();
                self.report_violation(
                    SecurityEventKind::CrossTenantCreateAttempt,
                    Operation::Create,
                    principal,
                    &requested,
                    Some(&tenant),
                    record.record_id(),
                );
                return Err(BulkheadError::CrossTenantViolation {
                    requested: requested.to_string(),
                    actual: tenant.to_string(),
                });
            }
        }

        record.assign_tenant(tenant.clone());

        let conn = self.pool.acquire().await?;
        let session = TenantSession::begin(conn, &tenant)?;
        self.table.insert(session.connection(), record.clone()).await?;
        drop(session);

        record_guard_op(R::RESOURCE, Operation::Create);
        debug!(
            resource = R::RESOURCE,
            id = %record.record_id(),
            tenant = %tenant,
            "Record created"
        );
        Ok(record)
    }

    /// Replaces a row the principal's tenant owns.
    ///
    /// Ownership is checked against the actual stored owner so cross-tenant
    /// attempts are reported with the real pair, then re-verified by the
    /// table under its write lock. The stored tenant value is immutable: a
    /// payload naming any other tenant is rejected, never re-stamped over.
    pub async fn update(&self, principal: &Principal, id: &RecordId, mut record: R) -> Result<R> {
        let tenant = self.resolve_tenant(principal, Operation::Update)?;
        self.handler.validate(&record)?;
        self.check_ownership(principal, Operation::Update, &tenant, id)
            .await?;

        if let Some(requested) = record.tenant_id() {
            if requested != &tenant {
                let requested = requested.clone();
                self.report_violation(
                    SecurityEventKind::CrossTenantUpdateAttempt,
                    Operation::Update,
                    principal,
                    &requested,
                    Some(&tenant),
                    id,
                );
                return Err(BulkheadError::CrossTenantViolation {
                    requested: requested.to_string(),
                    actual: tenant.to_string(),
                });
            }
        }

        record.assign_tenant(tenant.clone());

        let conn = self.pool.acquire().await?;
        let session = TenantSession::begin(conn, &tenant)?;
        let updated = self.table.update(session.connection(), id, record).await?;
        drop(session);

        record_guard_op(R::RESOURCE, Operation::Update);
        Ok(updated)
    }

    /// Deletes a row the principal's tenant owns.
    pub async fn delete(&self, principal: &Principal, id: &RecordId) -> Result<R> {
        let tenant = self.resolve_tenant(principal, Operation::Delete)?;
        self.check_ownership(principal, Operation::Delete, &tenant, id)
            .await?;

        let conn = self.pool.acquire().await?;
        let session = TenantSession::begin(conn, &tenant)?;
        let removed = self.table.remove(session.connection(), id).await?;
        drop(session);

        record_guard_op(R::RESOURCE, Operation::Delete);
        Ok(removed)
    }

    /// Verifies that the row, if present, belongs to `tenant`.
    ///
    /// Reads the actual owner without policy filtering so the violation
    /// report carries the true pair; the table re-verifies under its write
    /// lock, so a concurrent owner change still cannot slip a write through.
    async fn check_ownership(
        &self,
        principal: &Principal,
        operation: Operation,
        tenant: &TenantId,
        id: &RecordId,
    ) -> Result<()> {
        let existing = match self.table.peek(id).await {
            Some(row) => row,
            // Missing rows surface as NotFound from the table itself.
            None => return Ok(()),
        };

        match existing.tenant_id() {
            Some(actual) if actual == tenant => Ok(()),
            Some(actual) => {
                let actual = actual.clone();
                let kind = match operation {
                    Operation::Delete => SecurityEventKind::CrossTenantDeleteAttempt,
                    _ => SecurityEventKind::CrossTenantUpdateAttempt,
                };
                self.report_violation(kind, operation, principal, tenant, Some(&actual), id);
                Err(BulkheadError::CrossTenantViolation {
                    requested: tenant.to_string(),
                    actual: actual.to_string(),
                })
            }
            None => {
                self.report_defects(principal, operation, tenant, std::slice::from_ref(id));
                Err(BulkheadError::SchemaDefect {
                    resource: R::RESOURCE.to_string(),
                    reason: format!("row {} has no tenant value", id),
                })
            }
        }
    }

    fn report_no_context(&self, principal: &Principal, operation: Operation, reason: &str) {
        error!(
            principal = %principal.id,
            identity = %principal.identity,
            resource = R::RESOURCE,
            operation = operation.as_str(),
            reason,
            "Access refused: no tenant context"
        );
        record_violation(R::RESOURCE, SecurityEventKind::NoTenantContext);

        let event = SecurityEvent::builder(SecurityEventKind::NoTenantContext, operation)
            .principal(principal)
            .resource(R::RESOURCE)
            .detail("reason", reason)
            .build();
        self.detector.observe(event);
    }

    fn report_violation(
        &self,
        kind: SecurityEventKind,
        operation: Operation,
        principal: &Principal,
        requested: &TenantId,
        actual: Option<&TenantId>,
        id: &RecordId,
    ) {
        error!(
            principal = %principal.id,
            identity = %principal.identity,
            resource = R::RESOURCE,
            operation = operation.as_str(),
            requested_tenant = %requested,
            actual_tenant = ?actual,
            record = %id,
            "Cross-tenant access attempt blocked"
        );
        record_violation(R::RESOURCE, kind);

        let mut builder = SecurityEvent::builder(kind, operation)
            .principal(principal)
            .requested_tenant(requested.clone())
            .resource(R::RESOURCE)
            .detail("record_id", id.to_string());
        if let Some(actual) = actual {
            builder = builder.actual_tenant(actual.clone());
        }
        self.detector.observe(builder.build());
    }

    fn report_defects(
        &self,
        principal: &Principal,
        operation: Operation,
        tenant: &TenantId,
        defects: &[RecordId],
    ) {
        for id in defects {
            warn!(
                resource = R::RESOURCE,
                record = %id,
                "Row withheld: missing tenant value"
            );
            record_violation(R::RESOURCE, SecurityEventKind::MissingTenantColumn);

            let event = SecurityEvent::builder(SecurityEventKind::MissingTenantColumn, operation)
                .principal(principal)
                .requested_tenant(tenant.clone())
                .resource(R::RESOURCE)
                .detail("record_id", id.to_string())
                .build();
            self.detector.observe(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditConfig, MemoryAuditSink, SecurityAuditor, Severity};
    use crate::detect::{AlertConfig, AnomalyConfig};
    use crate::store::PoolConfig;

    #[derive(Debug, Clone)]
    struct Note {
        id: RecordId,
        tenant: Option<TenantId>,
        body: String,
    }

    impl Note {
        fn new(body: &str) -> Self {
            Self {
                id: RecordId::generate(),
                tenant: None,
                body: body.to_string(),
            }
        }

        fn owned(body: &str, tenant: &str) -> Self {
            Self {
                id: RecordId::generate(),
                tenant: Some(TenantId::new(tenant)),
                body: body.to_string(),
            }
        }
    }

    impl TenantScoped for Note {
        const RESOURCE: &'static str = "notes";

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

    struct NonEmptyBody;

    impl ResourceHandler<Note> for NonEmptyBody {
        fn validate(&self, record: &Note) -> Result<()> {
            if record.body.is_empty() {
                return Err(BulkheadError::Validation("body must not be empty".into()));
            }
            Ok(())
        }
    }

    fn guard() -> AccessGuard<Note, DefaultHandler> {
        guard_with(DefaultHandler)
    }

    fn guard_with<H: ResourceHandler<Note>>(handler: H) -> AccessGuard<Note, H> {
        let sink = Arc::new(MemoryAuditSink::new(100));
        let auditor = SecurityAuditor::with_sink(AuditConfig::development(), sink);
        let detector = ViolationDetector::new(auditor, AlertConfig::default(), AnomalyConfig::default());
        AccessGuard::new(
            Arc::new(Table::new()),
            ConnectionPool::new(PoolConfig::default()),
            handler,
            detector,
        )
    }

    fn t1_alice() -> Principal {
        Principal::new("alice", "alice@example.com").with_tenant(TenantId::new("t1"))
    }

    fn t2_bob() -> Principal {
        Principal::new("bob", "bob@example.com").with_tenant(TenantId::new("t2"))
    }

    #[tokio::test]
    async fn test_create_stamps_resolved_tenant() {
        let guard = guard();
        let created = guard.create(&t1_alice(), Note::new("hello")).await.unwrap();
        assert_eq!(created.tenant_id(), Some(&TenantId::new("t1")));
    }

    #[tokio::test]
    async fn test_create_with_foreign_tenant_refused_and_reported() {
        let guard = guard();
        let alice = t1_alice();
        let note = Note::owned("sneaky", "t2");
        let id = note.id.clone();

        let err = guard.create(&alice, note).await.unwrap_err();
        assert!(matches!(
            err,
            BulkheadError::CrossTenantViolation { ref requested, ref actual }
                if requested.as_str() == "t2" && actual.as_str() == "t1"
        ));

        // Nothing was written
        assert!(guard.table.peek(&id).await.is_none());

        let events = guard.detector.auditor().recent_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SecurityEventKind::CrossTenantCreateAttempt);
        assert_eq!(events[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_reads_fail_closed_without_tenant() {
        let guard = guard();
        guard.create(&t1_alice(), Note::new("hello")).await.unwrap();

        let stranger = Principal::new("eve", "eve@example.com");
        assert!(guard.list(&stranger).await.unwrap().is_empty());

        let rows = guard.list(&t1_alice()).await.unwrap();
        assert!(guard.get(&stranger, &rows[0].id).await.unwrap().is_none());

        let events = guard.detector.auditor().recent_events();
        assert!(events
            .iter()
            .all(|e| e.kind == SecurityEventKind::NoTenantContext));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_writes_error_without_tenant() {
        let guard = guard();
        let stranger = Principal::new("eve", "eve@example.com");

        let err = guard.create(&stranger, Note::new("x")).await.unwrap_err();
        assert!(matches!(err, BulkheadError::NoTenantContext(_)));
        assert!(guard.table.is_empty().await);
    }

    #[tokio::test]
    async fn test_cross_tenant_rows_invisible() {
        let guard = guard();
        let alice = t1_alice();
        let bob = t2_bob();

        let a = guard.create(&alice, Note::new("a")).await.unwrap();
        guard.create(&bob, Note::new("b")).await.unwrap();

        let alice_rows = guard.list(&alice).await.unwrap();
        assert_eq!(alice_rows.len(), 1);
        assert_eq!(alice_rows[0].body, "a");

        assert!(guard.get(&bob, &a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cross_tenant_update_reported_with_true_owner() {
        let guard = guard();
        let alice = t1_alice();
        let a = guard.create(&alice, Note::new("a")).await.unwrap();

        let mut stolen = a.clone();
        stolen.body = "defaced".to_string();
        let err = guard.update(&t2_bob(), &a.id, stolen).await.unwrap_err();
        assert!(matches!(
            err,
            BulkheadError::CrossTenantViolation { ref requested, ref actual }
                if requested.as_str() == "t2" && actual.as_str() == "t1"
        ));

        // Row untouched
        assert_eq!(guard.table.peek(&a.id).await.unwrap().body, "a");

        let events = guard.detector.auditor().recent_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SecurityEventKind::CrossTenantUpdateAttempt);
        assert_eq!(events[0].requested_tenant, Some(TenantId::new("t2")));
        assert_eq!(events[0].actual_tenant, Some(TenantId::new("t1")));
    }

    #[tokio::test]
    async fn test_cross_tenant_delete_refused() {
        let guard = guard();
        let alice = t1_alice();
        let a = guard.create(&alice, Note::new("a")).await.unwrap();

        let err = guard.delete(&t2_bob(), &a.id).await.unwrap_err();
        assert!(matches!(err, BulkheadError::CrossTenantViolation { .. }));
        assert!(guard.table.peek(&a.id).await.is_some());

        let events = guard.detector.auditor().recent_events();
        assert_eq!(events[0].kind, SecurityEventKind::CrossTenantDeleteAttempt);
    }

    #[tokio::test]
    async fn test_update_rejects_payload_tenant_change() {
        let guard = guard();
        let alice = t1_alice();
        let a = guard.create(&alice, Note::new("a")).await.unwrap();

        // The owner herself cannot move a record to another tenant.
        let mut edited = a.clone();
        edited.tenant = Some(TenantId::new("t2"));
        edited.body = "moved".to_string();
        let err = guard.update(&alice, &a.id, edited).await.unwrap_err();
        assert!(matches!(
            err,
            BulkheadError::CrossTenantViolation { ref requested, ref actual }
                if requested.as_str() == "t2" && actual.as_str() == "t1"
        ));

        // Row untouched, attempt reported
        let stored = guard.table.peek(&a.id).await.unwrap();
        assert_eq!(stored.tenant_id(), Some(&TenantId::new("t1")));
        assert_eq!(stored.body, "a");

        let events = guard.detector.auditor().recent_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SecurityEventKind::CrossTenantUpdateAttempt);
        assert_eq!(events[0].requested_tenant, Some(TenantId::new("t2")));
        assert_eq!(events[0].actual_tenant, Some(TenantId::new("t1")));
    }

    #[tokio::test]
    async fn test_update_without_tenant_claim_restamps() {
        let guard = guard();
        let alice = t1_alice();
        let a = guard.create(&alice, Note::new("a")).await.unwrap();

        // A payload that omits the tenant keeps the record under the
        // resolved one.
        let mut edited = a.clone();
        edited.tenant = None;
        edited.body = "edited".to_string();
        let updated = guard.update(&alice, &a.id, edited).await.unwrap();
        assert_eq!(updated.tenant_id(), Some(&TenantId::new("t1")));
        assert_eq!(updated.body, "edited");
    }

    #[tokio::test]
    async fn test_missing_tenant_row_withheld_and_reported() {
        let guard = guard();
        let alice = t1_alice();
        let orphan = Note::new("legacy");
        let orphan_id = orphan.id.clone();
        guard.table.insert_raw(orphan).await;

        assert!(guard.list(&alice).await.unwrap().is_empty());
        assert!(guard.get(&alice, &orphan_id).await.unwrap().is_none());

        let events = guard.detector.auditor().recent_events();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.kind == SecurityEventKind::MissingTenantColumn));
    }

    #[tokio::test]
    async fn test_list_where_only_narrows() {
        let guard = guard();
        let alice = t1_alice();
        guard.create(&alice, Note::new("keep")).await.unwrap();
        guard.create(&alice, Note::new("skip")).await.unwrap();
        guard.create(&t2_bob(), Note::new("keep")).await.unwrap();

        let rows = guard
            .list_where(&alice, |n| n.body == "keep")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tenant_id(), Some(&TenantId::new("t1")));
    }

    #[tokio::test]
    async fn test_handler_validation_composes() {
        let guard = guard_with(NonEmptyBody);
        let err = guard.create(&t1_alice(), Note::new("")).await.unwrap_err();
        assert!(matches!(err, BulkheadError::Validation(_)));
        assert!(guard.table.is_empty().await);
    }

    #[tokio::test]
    async fn test_task_context_wins_resolution() {
        let guard = Arc::new(guard());
        let alice = t1_alice();

        let ctx = TenantContext::new(TenantId::new("t1"), alice.id.clone());
        let g = Arc::clone(&guard);
        let alice2 = alice.clone();
        ctx.scope(async move {
            // Same principal, context established once, resolution stable
            let first = g.resolve_tenant(&alice2, Operation::Get).unwrap();
            let second = g.resolve_tenant(&alice2, Operation::Get).unwrap();
            assert_eq!(first, second);
            assert_eq!(first, TenantId::new("t1"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_missing_row_is_not_found_for_writes() {
        let guard = guard();
        let ghost = RecordId::generate();
        let err = guard.delete(&t1_alice(), &ghost).await.unwrap_err();
        assert!(matches!(err, BulkheadError::NotFound(_)));
    }
}
