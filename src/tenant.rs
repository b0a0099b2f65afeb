//! Tenants, principals, and the tenant directory.
//!
//! A tenant is an isolated customer organization; a principal is an already
//! authenticated actor holding at most one tenant association. Authentication
//! itself happens upstream; this module only models the association the
//! enforcement layers key off.

use crate::error::{BulkheadError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Minimum length for a tenant ID.
pub const TENANT_ID_MIN_LENGTH: usize = 1;

/// Maximum length for a tenant ID (DNS subdomain label limit).
pub const TENANT_ID_MAX_LENGTH: usize = 63;

/// Unique tenant identifier.
///
/// Tenant IDs must:
/// - Be 1-63 characters long
/// - Contain only lowercase alphanumeric characters and hyphens
/// - Not start or end with a hyphen
/// - Not contain consecutive hyphens
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a new tenant ID without validation.
    ///
    /// # Warning
    /// This method does not validate the tenant ID format.
    /// Use `try_new` for user-provided input.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a new tenant ID with validation.
    pub fn try_new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate_format(&id)?;
        Ok(Self(id))
    }

    /// Validates a tenant ID format.
    pub fn validate_format(id: &str) -> Result<()> {
        if id.len() < TENANT_ID_MIN_LENGTH {
            return Err(BulkheadError::InvalidTenant(
                "tenant ID cannot be empty".to_string(),
            ));
        }

        if id.len() > TENANT_ID_MAX_LENGTH {
            return Err(BulkheadError::InvalidTenant(format!(
                "tenant ID exceeds maximum length of {} characters",
                TENANT_ID_MAX_LENGTH
            )));
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(BulkheadError::InvalidTenant(
                "tenant ID must contain only lowercase letters, numbers, and hyphens".to_string(),
            ));
        }

        if id.starts_with('-') || id.ends_with('-') {
            return Err(BulkheadError::InvalidTenant(
                "tenant ID cannot start or end with a hyphen".to_string(),
            ));
        }

        if id.contains("--") {
            return Err(BulkheadError::InvalidTenant(
                "tenant ID cannot contain consecutive hyphens".to_string(),
            ));
        }

        Ok(())
    }

    /// Checks if this tenant ID has a valid format.
    pub fn is_valid(&self) -> bool {
        Self::validate_format(&self.0).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique principal identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrincipalId(pub String);

impl PrincipalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An authenticated actor.
///
/// Principals carry at most one tenant association at a time. The association
/// is the *only* input to tenant resolution; a request can never name a tenant
/// directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Principal ID.
    pub id: PrincipalId,
    /// Identity string used for audit attribution (e.g. email).
    pub identity: String,
    /// The tenant this principal belongs to, if any.
    pub tenant: Option<TenantId>,
}

impl Principal {
    /// Creates a principal with no tenant association.
    pub fn new(id: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            id: PrincipalId::new(id),
            identity: identity.into(),
            tenant: None,
        }
    }

    /// Sets the tenant association.
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    /// Whether this principal belongs to a tenant.
    pub fn has_tenant(&self) -> bool {
        self.tenant.is_some()
    }
}

/// Tenant lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// Tenant is active and operational.
    #[default]
    Active,
    /// Tenant was closed. Soft state only; a deactivated tenant is never
    /// hard-deleted while its data still references it.
    Deactivated,
}

/// A tenant in the multi-tenant platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// Unique tenant ID.
    pub id: TenantId,
    /// Display name.
    pub name: String,
    /// Owning principal.
    pub owner: PrincipalId,
    /// Lifecycle status.
    pub status: TenantStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// When the tenant was deactivated, if it was.
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Tenant {
    /// Creates a new active tenant.
    pub fn new(id: TenantId, name: impl Into<String>, owner: PrincipalId) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            owner,
            status: TenantStatus::Active,
            created_at: now,
            updated_at: now,
            deactivated_at: None,
        }
    }

    /// Whether the tenant is active.
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }

    /// Soft-deactivates the tenant.
    pub fn deactivate(&mut self) {
        let now = Utc::now();
        self.status = TenantStatus::Deactivated;
        self.deactivated_at = Some(now);
        self.updated_at = now;
    }

    /// Reactivates a deactivated tenant.
    pub fn reactivate(&mut self) {
        if self.status == TenantStatus::Deactivated {
            self.status = TenantStatus::Active;
            self.deactivated_at = None;
            self.updated_at = Utc::now();
        }
    }
}

/// In-memory tenant directory.
///
/// Owns tenant records and the membership rules: owners get their association
/// when the tenant is created, everyone else must be invited into an existing
/// tenant; a principal never creates one implicitly.
pub struct TenantDirectory {
    /// All tenants.
    tenants: Arc<RwLock<HashMap<TenantId, Tenant>>>,
    /// Tenant name to ID mapping (for name lookups).
    name_index: Arc<RwLock<HashMap<String, TenantId>>>,
}

impl TenantDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            tenants: Arc::new(RwLock::new(HashMap::new())),
            name_index: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a new tenant and associates the owner with it.
    ///
    /// Returns the owner principal carrying the new association.
    pub async fn create_tenant(
        &self,
        id: TenantId,
        name: impl Into<String>,
        owner: Principal,
    ) -> Result<(Tenant, Principal)> {
        TenantId::validate_format(id.as_str())?;

        if owner.has_tenant() {
            return Err(BulkheadError::InvalidOperation(format!(
                "principal {} already belongs to a tenant",
                owner.id
            )));
        }

        let name = name.into();
        let mut tenants = self.tenants.write().await;
        let mut name_index = self.name_index.write().await;

        if tenants.contains_key(&id) {
            return Err(BulkheadError::AlreadyExists(format!(
                "tenant {} already exists",
                id
            )));
        }

        if name_index.contains_key(&name) {
            return Err(BulkheadError::AlreadyExists(format!(
                "tenant name '{}' already exists",
                name
            )));
        }

        let tenant = Tenant::new(id.clone(), name.clone(), owner.id.clone());

        info!(tenant_id = %id, name = %name, owner = %owner.id, "Creating tenant");

        name_index.insert(name, id.clone());
        tenants.insert(id.clone(), tenant.clone());

        Ok((tenant, owner.with_tenant(id)))
    }

    /// Gets a tenant by ID.
    pub async fn get_tenant(&self, id: &TenantId) -> Option<Tenant> {
        self.tenants.read().await.get(id).cloned()
    }

    /// Gets a tenant by name.
    pub async fn get_tenant_by_name(&self, name: &str) -> Option<Tenant> {
        let name_index = self.name_index.read().await;
        let id = name_index.get(name)?;
        self.tenants.read().await.get(id).cloned()
    }

    /// Lists tenants.
    pub async fn list_tenants(&self, include_deactivated: bool) -> Vec<Tenant> {
        self.tenants
            .read()
            .await
            .values()
            .filter(|t| include_deactivated || t.is_active())
            .cloned()
            .collect()
    }

    /// Invites a principal into an existing tenant.
    ///
    /// Fails if the principal already has an association or the tenant is not
    /// active. Returns the principal carrying the new association.
    pub async fn invite(&self, principal: Principal, tenant_id: &TenantId) -> Result<Principal> {
        if principal.has_tenant() {
            return Err(BulkheadError::InvalidOperation(format!(
                "principal {} already belongs to a tenant",
                principal.id
            )));
        }

        let tenants = self.tenants.read().await;
        let tenant = tenants
            .get(tenant_id)
            .ok_or_else(|| BulkheadError::NotFound(format!("tenant {}", tenant_id)))?;

        if !tenant.is_active() {
            return Err(BulkheadError::InvalidOperation(format!(
                "tenant {} is not active",
                tenant_id
            )));
        }

        debug!(tenant_id = %tenant_id, principal = %principal.id, "Invited principal into tenant");

        Ok(principal.with_tenant(tenant_id.clone()))
    }

    /// Soft-deactivates a tenant.
    pub async fn deactivate_tenant(&self, id: &TenantId) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        let tenant = tenants
            .get_mut(id)
            .ok_or_else(|| BulkheadError::NotFound(format!("tenant {}", id)))?;

        if !tenant.is_active() {
            return Err(BulkheadError::InvalidOperation(format!(
                "tenant {} is already deactivated",
                id
            )));
        }

        tenant.deactivate();
        warn!(tenant_id = %id, "Deactivated tenant");

        Ok(())
    }

    /// Reactivates a deactivated tenant.
    pub async fn reactivate_tenant(&self, id: &TenantId) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        let tenant = tenants
            .get_mut(id)
            .ok_or_else(|| BulkheadError::NotFound(format!("tenant {}", id)))?;

        tenant.reactivate();
        info!(tenant_id = %id, "Reactivated tenant");

        Ok(())
    }

    /// Checks if a tenant exists and is active.
    pub async fn is_tenant_active(&self, id: &TenantId) -> bool {
        self.tenants
            .read()
            .await
            .get(id)
            .map(|t| t.is_active())
            .unwrap_or(false)
    }
}

impl Default for TenantDirectory {
    fn default() -> Self {
        Self::new()
    }
}
