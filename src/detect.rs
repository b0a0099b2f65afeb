//! Violation detection and alerting.
//!
//! The detector sits between the access guard / policy layer and the audit
//! trail: it classifies every anomaly, appends it to the trail, and decides
//! whether to page someone. Alert delivery is debounced per
//! `(event kind, severity)` so a storm of identical violations produces one
//! page, not hundreds; everything is off the request path and a detector
//! failure can never fail the operation that tripped it.

use crate::audit::{SecurityAuditor, SecurityEvent, SecurityEventKind, Severity};
use crate::tenant::{Principal, TenantId};
use crate::types::Operation;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Alert notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    /// Emit the alert to the process log.
    Log,
    /// POST the event as JSON to a webhook URL.
    Webhook { url: String },
}

/// Alerting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Minimum gap between alerts for the same (kind, severity).
    pub cooldown: Duration,
    /// Where alerts are delivered.
    pub channels: Vec<NotificationChannel>,
    /// How often to emit the periodic aggregate report.
    pub report_interval: Duration,
    /// Trailing window the periodic report covers.
    pub report_window: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30 * 60),
            channels: vec![NotificationChannel::Log],
            report_interval: Duration::from_secs(15 * 60),
            report_window: Duration::from_secs(60 * 60),
        }
    }
}

/// Debounced alert dispatcher.
///
/// Critical events escalate immediately (outside the cooldown); lower
/// severities are never paged individually; they surface through the
/// periodic aggregate report instead.
pub struct Alerter {
    config: AlertConfig,
    last_sent: Mutex<HashMap<(SecurityEventKind, Severity), Instant>>,
    tx: mpsc::Sender<SecurityEvent>,
    dispatched: AtomicU64,
    suppressed: AtomicU64,
    dropped: AtomicU64,
}

const ALERT_CHANNEL_CAPACITY: usize = 256;

impl Alerter {
    /// Creates the alerter and spawns its notification handler.
    pub fn new(config: AlertConfig) -> Self {
        let (tx, rx) = mpsc::channel(ALERT_CHANNEL_CAPACITY);
        tokio::spawn(Self::notification_handler(rx, config.channels.clone()));
        Self::from_parts(config, tx)
    }

    /// An alerter whose channel is drained by the returned receiver instead
    /// of a spawned handler.
    #[cfg(test)]
    fn suspended(config: AlertConfig, capacity: usize) -> (Self, mpsc::Receiver<SecurityEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::from_parts(config, tx), rx)
    }

    fn from_parts(config: AlertConfig, tx: mpsc::Sender<SecurityEvent>) -> Self {
        Self {
            config,
            last_sent: Mutex::new(HashMap::new()),
            tx,
            dispatched: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Routes an event toward notification. Never blocks.
    pub fn alert(&self, event: &SecurityEvent) {
        if event.severity < Severity::Critical {
            debug!(
                kind = event.kind.as_str(),
                severity = event.severity.as_str(),
                "Non-critical event held for periodic report"
            );
            return;
        }

        let key = (event.kind, event.severity);
        {
            let mut last_sent = self.last_sent.lock();
            if let Some(sent_at) = last_sent.get(&key) {
                if sent_at.elapsed() < self.config.cooldown {
                    self.suppressed.fetch_add(1, Ordering::Relaxed);
                    counter!("bulkhead_alerts_suppressed_total").increment(1);
                    debug!(
                        kind = event.kind.as_str(),
                        "Alert suppressed within cooldown"
                    );
                    return;
                }
            }
            last_sent.insert(key, Instant::now());
        }

        match self.tx.try_send(event.clone()) {
            Ok(()) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                counter!("bulkhead_alerts_dispatched_total").increment(1);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("bulkhead_alerts_dropped_total").increment(1);
                warn!(error = %e, "Alert channel full, alert dropped");
            }
        }
    }

    /// Number of alerts handed to the notification channels.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Number of alerts suppressed by the cooldown.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Number of alerts lost to a full channel.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn notification_handler(
        mut rx: mpsc::Receiver<SecurityEvent>,
        channels: Vec<NotificationChannel>,
    ) {
        let client = reqwest::Client::new();

        while let Some(event) = rx.recv().await {
            for channel in &channels {
                match channel {
                    NotificationChannel::Log => {
                        warn!(
                            target: "bulkhead::alerts",
                            kind = event.kind.as_str(),
                            severity = event.severity.as_str(),
                            principal = %event.principal_id,
                            requested_tenant = ?event.requested_tenant,
                            actual_tenant = ?event.actual_tenant,
                            resource = %event.resource,
                            "SECURITY ALERT"
                        );
                    }
                    NotificationChannel::Webhook { url } => {
                        if let Err(e) = client.post(url).json(&event).send().await {
                            warn!(error = %e, url = %url, "Failed to deliver webhook alert");
                        }
                    }
                }
            }
        }
    }
}

/// High-volume anomaly configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Whether anomaly detection is enabled.
    pub enabled: bool,
    /// Sliding window length.
    pub window: Duration,
    /// Rows fetched within the window before a tenant is flagged.
    pub max_rows_per_window: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            max_rows_per_window: 10_000,
        }
    }
}

/// Sliding-window tracker of per-tenant fetch volume.
///
/// An abnormally large single-tenant fetch count usually means a filter is
/// missing somewhere upstream; crossing the threshold flags the tenant once
/// and resets its window.
pub struct AnomalyTracker {
    config: AnomalyConfig,
    windows: Mutex<HashMap<TenantId, VecDeque<(Instant, u64)>>>,
}

impl AnomalyTracker {
    /// Creates a tracker.
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Records a fetch of `rows` for `tenant`.
    ///
    /// Returns the window total when the threshold was just crossed.
    pub fn observe(&self, tenant: &TenantId, rows: u64) -> Option<u64> {
        if !self.config.enabled || rows == 0 {
            return None;
        }

        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(tenant.clone()).or_default();

        while let Some((at, _)) = window.front() {
            if now.duration_since(*at) > self.config.window {
                window.pop_front();
            } else {
                break;
            }
        }

        window.push_back((now, rows));
        let total: u64 = window.iter().map(|(_, n)| n).sum();

        if total > self.config.max_rows_per_window {
            window.clear();
            Some(total)
        } else {
            None
        }
    }
}

/// Observes guard and policy outcomes; classifies, audits, and alerts.
pub struct ViolationDetector {
    auditor: Arc<SecurityAuditor>,
    alerter: Alerter,
    anomaly: AnomalyTracker,
}

impl ViolationDetector {
    /// Creates a detector and spawns the periodic report task.
    pub fn new(
        auditor: Arc<SecurityAuditor>,
        alert_config: AlertConfig,
        anomaly_config: AnomalyConfig,
    ) -> Arc<Self> {
        let report_interval = alert_config.report_interval;
        let report_window = alert_config.report_window;

        let detector = Arc::new(Self {
            alerter: Alerter::new(alert_config),
            anomaly: AnomalyTracker::new(anomaly_config),
            auditor: Arc::clone(&auditor),
        });

        if !report_interval.is_zero() {
            tokio::spawn(Self::periodic_report(auditor, report_interval, report_window));
        }

        detector
    }

    async fn periodic_report(
        auditor: Arc<SecurityAuditor>,
        interval: Duration,
        window: Duration,
    ) {
        let mut tick = tokio::time::interval(interval);
        tick.tick().await; // immediate first tick carries no data

        loop {
            tick.tick().await;
            let report = auditor.aggregate_report(window);
            if report.total_events == 0 {
                continue;
            }
            match serde_json::to_string(&report) {
                Ok(json) => info!(target: "bulkhead::reports", "{}", json),
                Err(e) => warn!(error = %e, "Failed to serialize aggregate report"),
            }
        }
    }

    /// Ingests one anomaly: appends to the audit trail and routes alerting.
    pub fn observe(&self, event: SecurityEvent) {
        counter!(
            "bulkhead_security_events_total",
            "kind" => event.kind.as_str(),
            "severity" => event.severity.as_str()
        )
        .increment(1);

        self.alerter.alert(&event);
        self.auditor.record(event);
    }

    /// Reports a filtered-read volume for anomaly tracking.
    pub fn observe_fetch(
        &self,
        principal: &Principal,
        tenant: &TenantId,
        resource: &str,
        rows: u64,
    ) {
        if let Some(total) = self.anomaly.observe(tenant, rows) {
            let event =
                SecurityEvent::builder(SecurityEventKind::HighVolumeAnomaly, Operation::List)
                    .principal(principal)
                    .actual_tenant(tenant.clone())
                    .resource(resource)
                    .detail("rows_in_window", total.to_string())
                    .build();
            self.observe(event);
        }
    }

    /// The auditor backing this detector.
    pub fn auditor(&self) -> &Arc<SecurityAuditor> {
        &self.auditor
    }

    /// Number of alerts dispatched so far.
    pub fn alerts_dispatched(&self) -> u64 {
        self.alerter.dispatched()
    }

    /// Number of alerts suppressed by the cooldown so far.
    pub fn alerts_suppressed(&self) -> u64 {
        self.alerter.suppressed()
    }
}
