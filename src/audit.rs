//! Security event audit trail.
//!
//! Every isolation-check anomaly produces an immutable [`SecurityEvent`].
//! Events are appended, never mutated or deleted; persistence is
//! fire-and-forget off the request path, and a failing sink degrades to
//! best-effort local logging. Auditing can never fail the operation that
//! triggered it.

use crate::error::{BulkheadError, Result};
use crate::tenant::{Principal, TenantId};
use crate::types::Operation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{error, info, warn};

/// Event severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational, no action required.
    Info,
    /// Should be investigated; batched into periodic reports.
    Warning,
    /// Isolation boundary was tested; escalated immediately.
    Critical,
}

impl Severity {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Isolation-check anomaly taxonomy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventKind {
    /// A principal without a tenant association attempted an operation.
    NoTenantContext,
    /// A create payload named a tenant other than the resolved one.
    CrossTenantCreateAttempt,
    /// An update targeted another tenant's record or tried to move one.
    CrossTenantUpdateAttempt,
    /// A delete targeted another tenant's record.
    CrossTenantDeleteAttempt,
    /// A tenant-scoped row is missing its tenant value.
    MissingTenantColumn,
    /// Abnormally large single-tenant fetch volume.
    HighVolumeAnomaly,
}

impl SecurityEventKind {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::NoTenantContext => "NO_TENANT_CONTEXT",
            SecurityEventKind::CrossTenantCreateAttempt => "CROSS_TENANT_CREATE_ATTEMPT",
            SecurityEventKind::CrossTenantUpdateAttempt => "CROSS_TENANT_UPDATE_ATTEMPT",
            SecurityEventKind::CrossTenantDeleteAttempt => "CROSS_TENANT_DELETE_ATTEMPT",
            SecurityEventKind::MissingTenantColumn => "MISSING_TENANT_COLUMN",
            SecurityEventKind::HighVolumeAnomaly => "HIGH_VOLUME_ANOMALY",
        }
    }

    /// Default severity classification for this kind.
    pub fn default_severity(&self) -> Severity {
        match self {
            SecurityEventKind::NoTenantContext
            | SecurityEventKind::CrossTenantCreateAttempt
            | SecurityEventKind::CrossTenantUpdateAttempt
            | SecurityEventKind::CrossTenantDeleteAttempt => Severity::Critical,
            SecurityEventKind::MissingTenantColumn | SecurityEventKind::HighVolumeAnomaly => {
                Severity::Warning
            }
        }
    }
}

/// An immutable record of one isolation-check outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Unique event ID.
    pub id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Event kind.
    pub kind: SecurityEventKind,
    /// Severity classification.
    pub severity: Severity,
    /// Acting principal's ID.
    pub principal_id: String,
    /// Acting principal's identity string for attribution.
    pub principal_identity: String,
    /// Tenant the request asked for, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_tenant: Option<TenantId>,
    /// Tenant that actually owns the data / was resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_tenant: Option<TenantId>,
    /// Resource the operation targeted.
    pub resource: String,
    /// Operation that triggered the check.
    pub operation: Operation,
    /// Additional context.
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub details: HashMap<String, String>,
}

impl SecurityEvent {
    /// Create a new event builder.
    pub fn builder(kind: SecurityEventKind, operation: Operation) -> SecurityEventBuilder {
        SecurityEventBuilder::new(kind, operation)
    }
}

/// Builder for security events.
pub struct SecurityEventBuilder {
    kind: SecurityEventKind,
    operation: Operation,
    severity: Option<Severity>,
    principal_id: String,
    principal_identity: String,
    requested_tenant: Option<TenantId>,
    actual_tenant: Option<TenantId>,
    resource: String,
    details: HashMap<String, String>,
}

impl SecurityEventBuilder {
    /// Create a new builder.
    pub fn new(kind: SecurityEventKind, operation: Operation) -> Self {
        Self {
            kind,
            operation,
            severity: None,
            principal_id: "unknown".to_string(),
            principal_identity: "unknown".to_string(),
            requested_tenant: None,
            actual_tenant: None,
            resource: String::new(),
            details: HashMap::new(),
        }
    }

    /// Set the acting principal.
    pub fn principal(mut self, principal: &Principal) -> Self {
        self.principal_id = principal.id.as_str().to_string();
        self.principal_identity = principal.identity.clone();
        self
    }

    /// Set the tenant the request asked for.
    pub fn requested_tenant(mut self, tenant: TenantId) -> Self {
        self.requested_tenant = Some(tenant);
        self
    }

    /// Set the tenant that owns the data.
    pub fn actual_tenant(mut self, tenant: TenantId) -> Self {
        self.actual_tenant = Some(tenant);
        self
    }

    /// Set the targeted resource.
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Override the severity classification.
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Add a detail.
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Build the event.
    pub fn build(self) -> SecurityEvent {
        SecurityEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            severity: self.severity.unwrap_or_else(|| self.kind.default_severity()),
            kind: self.kind,
            principal_id: self.principal_id,
            principal_identity: self.principal_identity,
            requested_tenant: self.requested_tenant,
            actual_tenant: self.actual_tenant,
            resource: self.resource,
            operation: self.operation,
            details: self.details,
        }
    }
}

/// Audit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Whether audit persistence is enabled.
    pub enabled: bool,
    /// Log file path.
    pub log_path: PathBuf,
    /// Maximum log file size in bytes before rotation.
    pub max_file_size: u64,
    /// Whether to mirror events to the process log.
    pub log_to_stdout: bool,
    /// Buffer size for the background writer channel.
    pub buffer_size: usize,
    /// Flush interval in milliseconds.
    pub flush_interval_ms: u64,
    /// How many recent events to retain in memory for reporting.
    pub retained_events: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: PathBuf::from("/var/log/bulkhead/security.log"),
            max_file_size: 100 * 1024 * 1024,
            log_to_stdout: false,
            buffer_size: 10_000,
            flush_interval_ms: 1_000,
            retained_events: 50_000,
        }
    }
}

impl AuditConfig {
    /// Configuration for development.
    pub fn development() -> Self {
        Self {
            log_path: PathBuf::from("./security.log"),
            max_file_size: 10 * 1024 * 1024,
            log_to_stdout: true,
            buffer_size: 1_000,
            flush_interval_ms: 100,
            retained_events: 5_000,
            enabled: true,
        }
    }
}

/// Audit sink trait.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one event.
    async fn record(&self, event: &SecurityEvent) -> Result<()>;
    /// Flush buffered events.
    async fn flush(&self) -> Result<()>;
    /// Close the sink.
    async fn close(&self) -> Result<()>;
}

/// File-based audit sink writing JSON lines with size-based rotation.
pub struct FileAuditSink {
    file: RwLock<Option<File>>,
    path: PathBuf,
    max_size: u64,
    current_size: RwLock<u64>,
}

impl FileAuditSink {
    /// Create a new file sink.
    pub async fn new(path: PathBuf, max_size: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let current_size = file.metadata().await?.len();

        Ok(Self {
            file: RwLock::new(Some(file)),
            path,
            max_size,
            current_size: RwLock::new(current_size),
        })
    }

    async fn rotate_if_needed(&self) -> Result<()> {
        let size = *self.current_size.read().await;
        if size >= self.max_size {
            let mut file_guard = self.file.write().await;
            if let Some(file) = file_guard.take() {
                drop(file);

                let rotated_path = self
                    .path
                    .with_extension(format!("{}.log", Utc::now().format("%Y%m%d_%H%M%S")));
                tokio::fs::rename(&self.path, &rotated_path).await?;

                let new_file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?;

                *file_guard = Some(new_file);
                *self.current_size.write().await = 0;

                info!(?rotated_path, "Rotated security audit log");
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuditSink for FileAuditSink {
    async fn record(&self, event: &SecurityEvent) -> Result<()> {
        self.rotate_if_needed().await?;

        let line = serde_json::to_string(event)? + "\n";
        let bytes = line.as_bytes();

        let mut file_guard = self.file.write().await;
        match file_guard.as_mut() {
            Some(file) => {
                file.write_all(bytes).await?;
                *self.current_size.write().await += bytes.len() as u64;
                Ok(())
            }
            None => Err(BulkheadError::AuditSinkUnavailable(
                "audit file is closed".to_string(),
            )),
        }
    }

    async fn flush(&self) -> Result<()> {
        let mut file_guard = self.file.write().await;
        if let Some(file) = file_guard.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut file_guard = self.file.write().await;
        if let Some(file) = file_guard.take() {
            file.sync_all().await?;
        }
        Ok(())
    }
}

/// In-memory audit sink for testing.
pub struct MemoryAuditSink {
    events: RwLock<VecDeque<SecurityEvent>>,
    max_events: usize,
}

impl MemoryAuditSink {
    /// Create a new memory sink.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(max_events)),
            max_events,
        }
    }

    /// Get all stored events.
    pub async fn events(&self) -> Vec<SecurityEvent> {
        self.events.read().await.iter().cloned().collect()
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &SecurityEvent) -> Result<()> {
        let mut events = self.events.write().await;
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// The security auditor.
///
/// `record` appends to a bounded in-memory window synchronously (so reports
/// are immediately consistent) and hands the event to a background writer
/// without blocking. A full queue or failing sink downgrades to local logging.
pub struct SecurityAuditor {
    config: AuditConfig,
    recent: Arc<parking_lot::RwLock<VecDeque<SecurityEvent>>>,
    sender: mpsc::Sender<SecurityEvent>,
    broadcast: broadcast::Sender<SecurityEvent>,
}

impl SecurityAuditor {
    /// Create an auditor persisting to the configured file sink.
    pub async fn new(config: AuditConfig) -> Result<Arc<Self>> {
        let sink: Arc<dyn AuditSink> = Arc::new(
            FileAuditSink::new(config.log_path.clone(), config.max_file_size).await?,
        );
        Ok(Self::with_sink(config, sink))
    }

    /// Create an auditor with a custom sink.
    pub fn with_sink(config: AuditConfig, sink: Arc<dyn AuditSink>) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.buffer_size.max(1));
        let (broadcast, _) = broadcast::channel(1024);

        if config.enabled {
            tokio::spawn(Self::background_writer(
                receiver,
                sink,
                Duration::from_millis(config.flush_interval_ms.max(1)),
                broadcast.clone(),
            ));
        }

        Arc::new(Self {
            recent: Arc::new(parking_lot::RwLock::new(VecDeque::with_capacity(
                config.retained_events.min(4096),
            ))),
            config,
            sender,
            broadcast,
        })
    }

    async fn background_writer(
        mut receiver: mpsc::Receiver<SecurityEvent>,
        sink: Arc<dyn AuditSink>,
        flush_interval: Duration,
        broadcast: broadcast::Sender<SecurityEvent>,
    ) {
        let mut flush_tick = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                maybe_event = receiver.recv() => {
                    let Some(event) = maybe_event else { break };
                    if let Err(e) = sink.record(&event).await {
                        // Best effort only: the triggering operation already
                        // completed, so log locally and move on.
                        error!(error = %e, event_id = %event.id, "Failed to persist security event");
                    }
                    let _ = broadcast.send(event);
                }
                _ = flush_tick.tick() => {
                    if let Err(e) = sink.flush().await {
                        error!(error = %e, "Failed to flush security audit sink");
                    }
                }
            }
        }

        if let Err(e) = sink.close().await {
            error!(error = %e, "Failed to close security audit sink");
        }
    }

    /// Appends an event to the trail. Never blocks, never fails.
    pub fn record(&self, event: SecurityEvent) {
        if self.config.log_to_stdout {
            if let Ok(json) = serde_json::to_string(&event) {
                info!(target: "bulkhead::audit", "{}", json);
            }
        }

        {
            let mut recent = self.recent.write();
            if recent.len() >= self.config.retained_events {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        if !self.config.enabled {
            return;
        }

        if let Err(e) = self.sender.try_send(event) {
            // Degraded mode: the event stays in the in-memory window and the
            // process log, but persistence is skipped.
            warn!(
                error = %BulkheadError::AuditSinkUnavailable(e.to_string()),
                "Audit queue full, event not persisted"
            );
        }
    }

    /// The retained in-memory event window, oldest first.
    pub fn recent_events(&self) -> Vec<SecurityEvent> {
        self.recent.read().iter().cloned().collect()
    }

    /// Subscribe to persisted events.
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.broadcast.subscribe()
    }

    /// Aggregates the trailing `window` of events into a report.
    pub fn aggregate_report(&self, window: Duration) -> AuditReport {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(0));

        let recent = self.recent.read();
        let mut groups: BTreeMap<(SecurityEventKind, Severity), ReportEntry> = BTreeMap::new();
        let mut principals = BTreeSet::new();
        let mut tenants = BTreeSet::new();
        let mut total = 0usize;

        for event in recent.iter().filter(|e| e.timestamp >= cutoff) {
            total += 1;
            principals.insert(event.principal_id.clone());
            for tenant in event
                .requested_tenant
                .iter()
                .chain(event.actual_tenant.iter())
            {
                tenants.insert(tenant.as_str().to_string());
            }

            let entry = groups
                .entry((event.kind, event.severity))
                .or_insert_with(|| ReportEntry {
                    kind: event.kind,
                    severity: event.severity,
                    count: 0,
                    first_seen: event.timestamp,
                    last_seen: event.timestamp,
                });
            entry.count += 1;
            entry.first_seen = entry.first_seen.min(event.timestamp);
            entry.last_seen = entry.last_seen.max(event.timestamp);
        }

        AuditReport {
            generated_at: now,
            window_secs: window.as_secs(),
            total_events: total,
            entries: groups.into_values().collect(),
            principals: principals.into_iter().collect(),
            tenants: tenants.into_iter().collect(),
        }
    }
}

/// One (kind, severity) group within a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub count: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Aggregated view of the audit trail over a trailing window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub generated_at: DateTime<Utc>,
    pub window_secs: u64,
    pub total_events: usize,
    pub entries: Vec<ReportEntry>,
    pub principals: Vec<String>,
    pub tenants: Vec<String>,
}
