//! Error types for the Bulkhead isolation core.
//!
//! This module provides a unified error type [`BulkheadError`] for all Bulkhead
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Isolation**: tenant resolution and cross-tenant access failures
//! - **Schema**: tenant-scoped entities missing their tenant column
//! - **Audit**: audit/alerting infrastructure failures (never fatal to requests)
//! - **Storage**: pool and table errors
//! - **Configuration**: invalid settings or missing configuration
//!
//! # Public surface
//!
//! Access-control failures must surface to callers as a uniform "not authorized",
//! deliberately indistinguishable from "no such record":
//!
//! ```rust
//! use bulkhead::error::BulkheadError;
//!
//! let err = BulkheadError::CrossTenantViolation {
//!     requested: "t2".into(),
//!     actual: "t1".into(),
//! };
//! assert_eq!(err.public_message(), "not authorized");
//! assert!(matches!(err.redact(), BulkheadError::NotAuthorized));
//! ```

use std::io;
use thiserror::Error;

/// Main error type for Bulkhead operations.
#[derive(Error, Debug)]
pub enum BulkheadError {
    // Isolation errors
    #[error("Invalid tenant identifier: {0}")]
    InvalidTenant(String),

    #[error("No tenant context for principal: {0}")]
    NoTenantContext(String),

    #[error("Cross-tenant violation: requested tenant {requested}, actual tenant {actual}")]
    CrossTenantViolation { requested: String, actual: String },

    #[error("Not authorized")]
    NotAuthorized,

    // Schema errors
    #[error("Schema defect in {resource}: {reason}")]
    SchemaDefect { resource: String, reason: String },

    // Audit errors
    #[error("Audit sink unavailable: {0}")]
    AuditSinkUnavailable(String),

    // Storage errors
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // External errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BulkheadError {
    /// Check whether this error is an access-control denial.
    pub fn is_access_denial(&self) -> bool {
        matches!(
            self,
            BulkheadError::InvalidTenant(_)
                | BulkheadError::NoTenantContext(_)
                | BulkheadError::CrossTenantViolation { .. }
                | BulkheadError::NotAuthorized
        )
    }

    /// Collapse denial and not-found errors into [`BulkheadError::NotAuthorized`].
    ///
    /// Applied at the outermost boundary so a caller cannot distinguish
    /// "record belongs to another tenant" from "record does not exist".
    pub fn redact(self) -> Self {
        if self.is_access_denial() || matches!(self, BulkheadError::NotFound(_)) {
            BulkheadError::NotAuthorized
        } else {
            self
        }
    }

    /// The message safe to show an end user.
    pub fn public_message(&self) -> &'static str {
        if self.is_access_denial() || matches!(self, BulkheadError::NotFound(_)) {
            "not authorized"
        } else {
            "internal error"
        }
    }
}

impl From<serde_json::Error> for BulkheadError {
    fn from(e: serde_json::Error) -> Self {
        BulkheadError::Serialization(e.to_string())
    }
}

/// Result type alias for Bulkhead operations.
pub type Result<T> = std::result::Result<T, BulkheadError>;
