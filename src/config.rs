//! Top-level configuration.
//!
//! One nested structure covers every subsystem; it loads from a JSON file,
//! validates as a whole before anything is constructed, and ships a
//! development preset with small limits and chatty output.

use crate::audit::AuditConfig;
use crate::detect::{AlertConfig, AnomalyConfig};
use crate::observability::ObservabilityConfig;
use crate::store::PoolConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BulkheadError, Result};

/// Complete service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Connection pool settings.
    pub pool: PoolConfig,
    /// Audit trail settings.
    pub audit: AuditConfig,
    /// Alert routing settings.
    pub alerting: AlertConfig,
    /// High-volume anomaly detection settings.
    pub anomaly: AnomalyConfig,
    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

impl BulkheadConfig {
    /// Loads configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration as a whole.
    pub fn validate(&self) -> Result<()> {
        if self.pool.size == 0 {
            return Err(BulkheadError::InvalidConfig {
                field: "pool.size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pool.acquire_timeout.is_zero() {
            return Err(BulkheadError::InvalidConfig {
                field: "pool.acquire_timeout".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.audit.enabled {
            if self.audit.log_path.as_os_str().is_empty() {
                return Err(BulkheadError::InvalidConfig {
                    field: "audit.log_path".to_string(),
                    reason: "must be set when audit is enabled".to_string(),
                });
            }
            if self.audit.max_file_size == 0 {
                return Err(BulkheadError::InvalidConfig {
                    field: "audit.max_file_size".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
            if self.audit.buffer_size == 0 {
                return Err(BulkheadError::InvalidConfig {
                    field: "audit.buffer_size".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.audit.retained_events == 0 {
            return Err(BulkheadError::InvalidConfig {
                field: "audit.retained_events".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.alerting.cooldown.is_zero() {
            return Err(BulkheadError::InvalidConfig {
                field: "alerting.cooldown".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.anomaly.enabled {
            if self.anomaly.window.is_zero() {
                return Err(BulkheadError::InvalidConfig {
                    field: "anomaly.window".to_string(),
                    reason: "must be positive when anomaly detection is enabled".to_string(),
                });
            }
            if self.anomaly.max_rows_per_window == 0 {
                return Err(BulkheadError::InvalidConfig {
                    field: "anomaly.max_rows_per_window".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Development preset: small pool, local audit file, short cooldowns.
    pub fn development() -> Self {
        Self {
            pool: PoolConfig {
                size: 4,
                acquire_timeout: Duration::from_secs(5),
            },
            audit: AuditConfig::development(),
            alerting: AlertConfig {
                cooldown: Duration::from_secs(60),
                report_interval: Duration::from_secs(60),
                ..Default::default()
            },
            anomaly: AnomalyConfig {
                max_rows_per_window: 1_000,
                ..Default::default()
            },
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                json_logs: false,
            },
        }
    }

    /// Points the audit trail at a different file.
    pub fn with_audit_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit.log_path = path.into();
        self
    }
}
