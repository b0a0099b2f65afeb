//! Bulkhead is the tenant isolation core of a shared-database multi-tenant
//! platform: every tenant's rows live in the same tables, and this crate is
//! what keeps one tenant from ever seeing or touching another's.
//!
//! Enforcement is layered so no single bug is enough to leak data:
//!
//! - [`context`] resolves and carries the tenant a unit of work executes
//!   under, and models the session marker a pooled connection carries.
//! - [`policy`] is the row policy the storage engine itself evaluates on
//!   every read and write; with no session tenant it hides everything.
//! - [`store`] is the pooled, policy-enforced storage model; mutations
//!   re-verify ownership under the table write lock.
//! - [`guard`] is the application-facing surface; it stamps tenant values
//!   server-side, fails reads closed to empty results, and reports every
//!   blocked attempt.
//! - [`audit`] and [`detect`] keep the security trail and route alerts,
//!   entirely off the request path.
//!
//! Resources opt in by implementing [`policy::TenantScoped`]; anything not
//! implementing it cannot pass through a guard or a table at all.
//!
//! ```no_run
//! use bulkhead::audit::{MemoryAuditSink, SecurityAuditor};
//! use bulkhead::config::BulkheadConfig;
//! use bulkhead::detect::ViolationDetector;
//! use bulkhead::guard::{AccessGuard, DefaultHandler};
//! use bulkhead::policy::TenantScoped;
//! use bulkhead::store::{ConnectionPool, Table};
//! use bulkhead::types::RecordId;
//! use bulkhead::TenantId;
//! use std::sync::Arc;
//!
//! #[derive(Clone)]
//! struct Invoice {
//!     id: RecordId,
//!     tenant: Option<TenantId>,
//! }
//!
//! impl TenantScoped for Invoice {
//!     const RESOURCE: &'static str = "invoices";
//!     fn record_id(&self) -> &RecordId { &self.id }
//!     fn tenant_id(&self) -> Option<&TenantId> { self.tenant.as_ref() }
//!     fn assign_tenant(&mut self, tenant: TenantId) { self.tenant = Some(tenant); }
//! }
//!
//! # async fn setup() {
//! let config = BulkheadConfig::development();
//! let sink = Arc::new(MemoryAuditSink::new(1024));
//! let auditor = SecurityAuditor::with_sink(config.audit.clone(), sink);
//! let detector = ViolationDetector::new(auditor, config.alerting.clone(), config.anomaly.clone());
//! let guard: AccessGuard<Invoice, _> = AccessGuard::new(
//!     Arc::new(Table::new()),
//!     ConnectionPool::new(config.pool.clone()),
//!     DefaultHandler,
//!     detector,
//! );
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod context;
pub mod detect;
pub mod error;
pub mod guard;
pub mod observability;
pub mod policy;
pub mod store;
pub mod tenant;
pub mod types;

pub use config::BulkheadConfig;
pub use error::{BulkheadError, Result};
pub use tenant::{Principal, PrincipalId, Tenant, TenantDirectory, TenantId};
