use serde_json::Value;
use thiserror::Error;

use super::BoxFuture;
use super::counter::AllocatorError;
use crate::entities::{GeoPoint, Tenant};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration store unavailable: {0}")]
    Unavailable(String),
    #[error("tenant {tenant}: {reason}")]
    Malformed { tenant: Tenant, reason: String },
    #[error("tenant {tenant}: {kind} references unknown user '{user_id}'")]
    DanglingReference {
        tenant: Tenant,
        kind: &'static str,
        user_id: String,
    },
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error("migration operation failed: {0}")]
    Operation(String),
}

/// Raw documents of one tenant as they sit in storage.
#[derive(Clone, Debug, PartialEq)]
pub struct TenantSnapshot {
    pub tenant: Tenant,
    pub users: Vec<Value>,
    pub connections: Vec<Value>,
    pub events: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UserRewrite {
    pub old_id: String,
    pub document: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionRewrite {
    pub old_user_from_id: Value,
    pub old_user_to_id: Value,
    pub kind: String,
    pub document: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventRewrite {
    pub old_id: String,
    pub document: Value,
    pub geo: Option<GeoPoint>,
}

/// In-place rewrite of one tenant. Applied all-or-nothing, together with the
/// removal of every session of the tenant.
#[derive(Clone, Debug, PartialEq)]
pub struct TenantRewrite {
    pub tenant: Tenant,
    pub users: Vec<UserRewrite>,
    pub connections: Vec<ConnectionRewrite>,
    pub events: Vec<EventRewrite>,
}

pub trait MigrationStore: Send + Sync {
    fn list_tenants(&self) -> BoxFuture<'_, Result<Vec<Tenant>, MigrationError>>;
    fn load(&self, tenant: Tenant) -> BoxFuture<'_, Result<TenantSnapshot, MigrationError>>;
    /// Returns the number of sessions removed.
    fn apply(&self, rewrite: &TenantRewrite) -> BoxFuture<'_, Result<u64, MigrationError>>;
}
