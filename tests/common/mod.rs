//! Shared fixtures for the integration tests.

use bulkhead::audit::{AuditConfig, MemoryAuditSink, SecurityAuditor};
use bulkhead::detect::{AlertConfig, AnomalyConfig, ViolationDetector};
use bulkhead::guard::{AccessGuard, DefaultHandler};
use bulkhead::policy::TenantScoped;
use bulkhead::store::{ConnectionPool, PoolConfig, Table};
use bulkhead::types::RecordId;
use bulkhead::{Principal, TenantId};
use std::sync::Arc;
use std::time::Duration;

/// The resource under test: a billing invoice scoped to a tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    pub id: RecordId,
    pub tenant: Option<TenantId>,
    pub customer: String,
    pub amount_cents: i64,
}

impl Invoice {
    /// An invoice with no tenant value, as a client would submit it.
    pub fn new(customer: &str, amount_cents: i64) -> Self {
        Self {
            id: RecordId::generate(),
            tenant: None,
            customer: customer.to_string(),
            amount_cents,
        }
    }

    /// An invoice whose payload already claims a tenant.
    pub fn claiming_tenant(customer: &str, amount_cents: i64, tenant: &str) -> Self {
        Self {
            tenant: Some(TenantId::new(tenant)),
            ..Self::new(customer, amount_cents)
        }
    }
}

impl TenantScoped for Invoice {
    const RESOURCE: &'static str = "invoices";

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

/// A full enforcement stack over an in-memory audit sink.
pub struct TestStack {
    pub table: Arc<Table<Invoice>>,
    pub pool: Arc<ConnectionPool>,
    pub auditor: Arc<SecurityAuditor>,
    pub detector: Arc<ViolationDetector>,
    pub guard: AccessGuard<Invoice, DefaultHandler>,
}

impl TestStack {
    pub fn new() -> Self {
        // Long cooldown so alert counts stay deterministic unless a test
        // configures its own.
        Self::with_alerting(AlertConfig {
            cooldown: Duration::from_secs(3600),
            report_interval: Duration::ZERO,
            ..Default::default()
        })
    }

    pub fn with_alerting(alerting: AlertConfig) -> Self {
        let audit = AuditConfig {
            log_to_stdout: false,
            ..AuditConfig::development()
        };
        let sink = Arc::new(MemoryAuditSink::new(10_000));
        let auditor = SecurityAuditor::with_sink(audit, sink);
        let detector = ViolationDetector::new(
            Arc::clone(&auditor),
            alerting,
            AnomalyConfig::default(),
        );

        let table = Arc::new(Table::new());
        let pool = ConnectionPool::new(PoolConfig {
            size: 4,
            acquire_timeout: Duration::from_secs(1),
        });
        let guard = AccessGuard::new(
            Arc::clone(&table),
            Arc::clone(&pool),
            DefaultHandler,
            Arc::clone(&detector),
        );

        Self {
            table,
            pool,
            auditor,
            detector,
            guard,
        }
    }
}

pub fn alice() -> Principal {
    Principal::new("alice", "alice@example.com").with_tenant(TenantId::new("t1"))
}

pub fn bob() -> Principal {
    Principal::new("bob", "bob@example.com").with_tenant(TenantId::new("t2"))
}

pub fn stranger() -> Principal {
    Principal::new("eve", "eve@example.com")
}
