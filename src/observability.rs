//! Tracing setup and metric recording helpers.

use crate::audit::SecurityEventKind;
use crate::error::{BulkheadError, Result};
use crate::types::Operation;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing filter directive, e.g. "info" or "bulkhead=debug".
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| BulkheadError::Internal(format!("failed to init tracing: {}", e)))
}

/// Counts a guard operation that completed without a violation.
pub fn record_guard_op(resource: &'static str, operation: Operation) {
    counter!(
        "bulkhead_guard_operations_total",
        "resource" => resource,
        "operation" => operation.as_str()
    )
    .increment(1);
}

/// Counts a blocked access attempt by violation kind.
pub fn record_violation(resource: &'static str, kind: SecurityEventKind) {
    counter!(
        "bulkhead_violations_total",
        "resource" => resource,
        "kind" => kind.as_str()
    )
    .increment(1);
}
