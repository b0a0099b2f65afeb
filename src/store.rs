//! Storage engine model: pooled connections and policy-enforced tables.
//!
//! The engine evaluates the row policy itself on every read and write, so
//! tenant filtering holds even when a caller above it is buggy. Connections
//! carry the session marker the policy keys off; pooling deliberately does
//! *not* reset the marker on release, matching real pooled database
//! sessions. That is why every unit of work must go through
//! [`TenantSession`], whose `Drop` guarantees the reset on all exit paths.

use crate::context::SessionMarker;
use crate::error::{BulkheadError, Result};
use crate::policy::{PolicyDecision, RowPolicy, TenantScoped};
use crate::tenant::TenantId;
use crate::types::RecordId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, trace};

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of connections in the pool.
    pub size: usize,
    /// Maximum time to wait for a connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// A storage connection carrying the session-scoped tenant marker.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    marker: SessionMarker,
}

impl Connection {
    fn new(id: u64) -> Self {
        Self {
            id,
            marker: SessionMarker::new(),
        }
    }

    /// Connection identifier (stable across pool reuse).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The session marker this connection carries.
    pub fn session(&self) -> &SessionMarker {
        &self.marker
    }

    /// The tenant the session currently resolves to, if any.
    ///
    /// Re-validates the marker on every call; malformed markers resolve to
    /// `None` (fail closed).
    pub fn current_tenant(&self) -> Option<TenantId> {
        self.marker.get()
    }
}

/// Fixed-size connection pool.
///
/// Released connections keep whatever marker they carried; clearing it is the
/// unit of work's responsibility via [`TenantSession`].
pub struct ConnectionPool {
    idle: parking_lot::Mutex<VecDeque<Arc<Connection>>>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Creates a pool with `config.size` pre-built connections.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let idle = (0..config.size as u64).map(Connection::new).map(Arc::new).collect();
        Arc::new(Self {
            idle: parking_lot::Mutex::new(idle),
            permits: Arc::new(Semaphore::new(config.size)),
            config,
        })
    }

    /// Acquires a connection, waiting up to the configured timeout.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            BulkheadError::PoolExhausted(format!(
                "no connection available within {:?}",
                self.config.acquire_timeout
            ))
        })?
        .map_err(|e| BulkheadError::Internal(format!("connection pool closed: {}", e)))?;

        let conn = self
            .idle
            .lock()
            .pop_front()
            .ok_or_else(|| BulkheadError::Internal("pool permit without connection".to_string()))?;

        trace!(conn_id = conn.id(), "Acquired pooled connection");

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Number of currently idle connections.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A connection checked out of the pool; returned on drop.
pub struct PooledConnection {
    conn: Option<Arc<Connection>>,
    pool: Arc<ConnectionPool>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn_id", &self.conn.as_ref().map(|c| c.id()))
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            trace!(conn_id = conn.id(), "Returned connection to pool");
            self.pool.idle.lock().push_back(conn);
        }
    }
}

/// Scoped tenant session over a pooled connection.
///
/// Sets the session marker on construction and clears it on drop, so the
/// marker can never outlive the unit of work, including on early returns,
/// panics, and task cancellation.
pub struct TenantSession {
    conn: PooledConnection,
}

impl TenantSession {
    /// Begins a session for `tenant` on the given connection.
    pub fn begin(conn: PooledConnection, tenant: &TenantId) -> Result<Self> {
        conn.session().set(tenant)?;
        debug!(conn_id = conn.id(), tenant_id = %tenant, "Began tenant session");
        Ok(Self { conn })
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for TenantSession {
    fn drop(&mut self) {
        self.conn.session().clear();
        trace!(conn_id = self.conn.id(), "Cleared session marker");
    }
}

/// Result of a policy-filtered table scan.
#[derive(Debug, Clone)]
pub struct TableScan<R> {
    /// Rows visible to the session tenant.
    pub rows: Vec<R>,
    /// Records withheld because their tenant value is missing.
    pub defects: Vec<RecordId>,
}

/// Result of a policy-filtered point lookup.
#[derive(Debug, Clone)]
pub enum Lookup<R> {
    /// Row exists and belongs to the session tenant.
    Visible(R),
    /// Row exists but is invisible to the session.
    Withheld,
    /// Row exists but has no tenant value.
    Defect,
    /// No such row.
    Missing,
}

impl<R> Lookup<R> {
    /// Collapses to what a caller may see: hidden, defective, and missing rows
    /// are all indistinguishable.
    pub fn into_visible(self) -> Option<R> {
        match self {
            Lookup::Visible(r) => Some(r),
            _ => None,
        }
    }
}

/// A policy-enforced tenant-scoped table.
///
/// Every access runs the row policy against the connection's session marker.
/// Mutations execute under the table write lock so the ownership check and
/// the write form one atomic read-modify-write.
pub struct Table<R: TenantScoped> {
    rows: RwLock<HashMap<RecordId, R>>,
}

impl<R: TenantScoped> Table<R> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }

    /// Scans all rows visible to the session, applying an extra filter.
    pub async fn scan<F>(&self, conn: &Connection, filter: F) -> TableScan<R>
    where
        F: Fn(&R) -> bool,
    {
        let session = conn.current_tenant();
        let rows = self.rows.read().await;

        let mut visible = Vec::new();
        let mut defects = Vec::new();

        for row in rows.values() {
            match RowPolicy::evaluate(session.as_ref(), row) {
                PolicyDecision::Visible => {
                    if filter(row) {
                        visible.push(row.clone());
                    }
                }
                PolicyDecision::Hidden => {}
                PolicyDecision::SchemaDefect => defects.push(row.record_id().clone()),
            }
        }

        TableScan {
            rows: visible,
            defects,
        }
    }

    /// Looks up a single row through the policy.
    pub async fn lookup(&self, conn: &Connection, id: &RecordId) -> Lookup<R> {
        let session = conn.current_tenant();
        let rows = self.rows.read().await;

        match rows.get(id) {
            None => Lookup::Missing,
            Some(row) => match RowPolicy::evaluate(session.as_ref(), row) {
                PolicyDecision::Visible => Lookup::Visible(row.clone()),
                PolicyDecision::Hidden => Lookup::Withheld,
                PolicyDecision::SchemaDefect => Lookup::Defect,
            },
        }
    }

    /// Inserts a new row, writable only under the row's own tenant session.
    pub async fn insert(&self, conn: &Connection, record: R) -> Result<()> {
        let session = conn.current_tenant();

        match RowPolicy::writable(session.as_ref(), &record) {
            PolicyDecision::Visible => {}
            PolicyDecision::Hidden => return Err(BulkheadError::NotAuthorized),
            PolicyDecision::SchemaDefect => {
                return Err(BulkheadError::SchemaDefect {
                    resource: R::RESOURCE.to_string(),
                    reason: "row has no tenant value".to_string(),
                })
            }
        }

        let mut rows = self.rows.write().await;
        let id = record.record_id().clone();
        if rows.contains_key(&id) {
            return Err(BulkheadError::AlreadyExists(format!(
                "{} {}",
                R::RESOURCE,
                id
            )));
        }
        rows.insert(id, record);
        Ok(())
    }

    /// Replaces a row, re-verifying ownership and tenant immutability under
    /// the write lock.
    pub async fn update(&self, conn: &Connection, id: &RecordId, record: R) -> Result<R> {
        if record.record_id() != id {
            return Err(BulkheadError::Validation(format!(
                "record id {} does not match target {}",
                record.record_id(),
                id
            )));
        }

        let session = conn.current_tenant();
        let mut rows = self.rows.write().await;

        let existing = rows
            .get(id)
            .ok_or_else(|| BulkheadError::NotFound(format!("{} {}", R::RESOURCE, id)))?;

        match RowPolicy::evaluate(session.as_ref(), existing) {
            PolicyDecision::Visible => {}
            PolicyDecision::Hidden => return Err(BulkheadError::NotAuthorized),
            PolicyDecision::SchemaDefect => {
                return Err(BulkheadError::SchemaDefect {
                    resource: R::RESOURCE.to_string(),
                    reason: format!("row {} has no tenant value", id),
                })
            }
        }

        // Tenant column is immutable after creation, on every write path.
        if record.tenant_id() != existing.tenant_id() {
            return Err(BulkheadError::CrossTenantViolation {
                requested: record
                    .tenant_id()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unset".to_string()),
                actual: existing
                    .tenant_id()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unset".to_string()),
            });
        }

        rows.insert(id.clone(), record.clone());
        Ok(record)
    }

    /// Removes a row, re-verifying ownership under the write lock.
    pub async fn remove(&self, conn: &Connection, id: &RecordId) -> Result<R> {
        let session = conn.current_tenant();
        let mut rows = self.rows.write().await;

        let existing = rows
            .get(id)
            .ok_or_else(|| BulkheadError::NotFound(format!("{} {}", R::RESOURCE, id)))?;

        match RowPolicy::evaluate(session.as_ref(), existing) {
            PolicyDecision::Visible => {}
            PolicyDecision::Hidden => return Err(BulkheadError::NotAuthorized),
            PolicyDecision::SchemaDefect => {
                return Err(BulkheadError::SchemaDefect {
                    resource: R::RESOURCE.to_string(),
                    reason: format!("row {} has no tenant value", id),
                })
            }
        }

        Ok(rows.remove(id).expect("row present under write lock"))
    }

    /// Reads a row without policy filtering.
    ///
    /// Enforcement-layer use only: the access guard needs the actual owner
    /// tenant to report cross-tenant attempts. Never expose through a
    /// resource surface.
    pub async fn peek(&self, id: &RecordId) -> Option<R> {
        self.rows.read().await.get(id).cloned()
    }

    /// Inserts a row bypassing the policy.
    ///
    /// Migration/backfill path only; also how legacy rows without a tenant
    /// value end up in a table.
    pub async fn insert_raw(&self, record: R) {
        let mut rows = self.rows.write().await;
        rows.insert(record.record_id().clone(), record);
    }

    /// Total number of rows, unfiltered.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

impl<R: TenantScoped> Default for Table<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Doc {
        id: RecordId,
        tenant: Option<TenantId>,
        body: String,
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

    fn doc(tenant: &str, body: &str) -> Doc {
        Doc {
            id: RecordId::generate(),
            tenant: Some(TenantId::new(tenant)),
            body: body.to_string(),
        }
    }

    async fn session_conn(pool: &Arc<ConnectionPool>, tenant: &str) -> TenantSession {
        let conn = pool.acquire().await.unwrap();
        TenantSession::begin(conn, &TenantId::new(tenant)).unwrap()
    }

    #[tokio::test]
    async fn test_scan_filters_by_session_tenant() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let table = Table::new();

        table.insert_raw(doc("t1", "a")).await;
        table.insert_raw(doc("t1", "b")).await;
        table.insert_raw(doc("t2", "c")).await;

        let session = session_conn(&pool, "t1").await;
        let scan = table.scan(session.connection(), |_| true).await;
        assert_eq!(scan.rows.len(), 2);
        assert!(scan.rows.iter().all(|d| d.tenant == Some(TenantId::new("t1"))));
        assert!(scan.defects.is_empty());
    }

    #[tokio::test]
    async fn test_scan_without_session_is_empty() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let table = Table::new();
        table.insert_raw(doc("t1", "a")).await;

        let conn = pool.acquire().await.unwrap();
        let scan = table.scan(&conn, |_| true).await;
        assert!(scan.rows.is_empty());
    }

    #[tokio::test]
    async fn test_scan_reports_defective_rows() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let table = Table::new();

        let legacy = Doc {
            id: RecordId::new("legacy-1"),
            tenant: None,
            body: "pre-migration row".to_string(),
        };
        table.insert_raw(legacy).await;
        table.insert_raw(doc("t1", "a")).await;

        let session = session_conn(&pool, "t1").await;
        let scan = table.scan(session.connection(), |_| true).await;
        assert_eq!(scan.rows.len(), 1);
        assert_eq!(scan.defects, vec![RecordId::new("legacy-1")]);
    }

    #[tokio::test]
    async fn test_insert_requires_matching_session() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let table = Table::new();

        let session = session_conn(&pool, "t1").await;

        // Matching tenant: ok
        table
            .insert(session.connection(), doc("t1", "mine"))
            .await
            .unwrap();

        // Foreign tenant: engine refuses even if a buggy caller tries
        let err = table
            .insert(session.connection(), doc("t2", "theirs"))
            .await
            .unwrap_err();
        assert!(matches!(err, BulkheadError::NotAuthorized));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_rejects_tenant_change() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let table = Table::new();

        let original = doc("t1", "v1");
        let id = original.id.clone();
        table.insert_raw(original.clone()).await;

        let session = session_conn(&pool, "t1").await;

        let mut moved = original.clone();
        moved.tenant = Some(TenantId::new("t2"));
        let err = table
            .update(session.connection(), &id, moved)
            .await
            .unwrap_err();
        assert!(matches!(err, BulkheadError::CrossTenantViolation { .. }));

        // Unchanged tenant, changed body: ok
        let mut edited = original;
        edited.body = "v2".to_string();
        let updated = table.update(session.connection(), &id, edited).await.unwrap();
        assert_eq!(updated.body, "v2");
    }

    #[tokio::test]
    async fn test_remove_hidden_from_other_tenant() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let table = Table::new();

        let record = doc("t1", "keep");
        let id = record.id.clone();
        table.insert_raw(record).await;

        let session = session_conn(&pool, "t2").await;
        let err = table.remove(session.connection(), &id).await.unwrap_err();
        assert!(matches!(err, BulkheadError::NotAuthorized));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_session_drop_clears_marker() {
        let pool = ConnectionPool::new(PoolConfig {
            size: 1,
            acquire_timeout: Duration::from_secs(1),
        });

        {
            let session = session_conn(&pool, "t1").await;
            assert_eq!(
                session.connection().current_tenant(),
                Some(TenantId::new("t1"))
            );
        }

        // Same physical connection, marker gone
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.current_tenant(), None);
    }

    #[tokio::test]
    async fn test_pool_reuse_without_session_keeps_marker() {
        // The hazard TenantSession exists to prevent: raw marker writes
        // survive pool round-trips.
        let pool = ConnectionPool::new(PoolConfig {
            size: 1,
            acquire_timeout: Duration::from_secs(1),
        });

        {
            let conn = pool.acquire().await.unwrap();
            conn.session().set(&TenantId::new("t1")).unwrap();
        }

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.current_tenant(), Some(TenantId::new("t1")));
    }

    #[tokio::test]
    async fn test_pool_exhaustion_times_out() {
        let pool = ConnectionPool::new(PoolConfig {
            size: 1,
            acquire_timeout: Duration::from_millis(20),
        });

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, BulkheadError::PoolExhausted(_)));
    }
}
