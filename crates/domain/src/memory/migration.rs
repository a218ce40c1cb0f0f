use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::entities::{GeoPoint, Tenant};
use crate::ports::BoxFuture;
use crate::ports::migration::{MigrationError, MigrationStore, TenantRewrite, TenantSnapshot};

#[derive(Clone, Debug, Default)]
struct TenantDocuments {
    users: Vec<Value>,
    connections: Vec<Value>,
    events: Vec<(Value, Option<GeoPoint>)>,
    sessions: u64,
}

/// Per-tenant raw documents, shaped like the `app_<a>_<b>` schemas.
#[derive(Clone, Default)]
pub struct InMemoryMigrationStore {
    tenants: Arc<Mutex<BTreeMap<Tenant, TenantDocuments>>>,
    failing: Arc<Mutex<Option<Tenant>>>,
}

impl InMemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tenant(&self, tenant: Tenant, users: Vec<Value>, connections: Vec<Value>, events: Vec<Value>) {
        self.tenants.lock().insert(
            tenant,
            TenantDocuments {
                users,
                connections,
                events: events.into_iter().map(|event| (event, None)).collect(),
                sessions: 0,
            },
        );
    }

    pub fn add_sessions(&self, tenant: Tenant, count: u64) {
        if let Some(documents) = self.tenants.lock().get_mut(&tenant) {
            documents.sessions += count;
        }
    }

    pub fn sessions(&self, tenant: Tenant) -> u64 {
        self.tenants
            .lock()
            .get(&tenant)
            .map(|documents| documents.sessions)
            .unwrap_or_default()
    }

    pub fn snapshot(&self, tenant: Tenant) -> Option<TenantSnapshot> {
        self.tenants.lock().get(&tenant).map(|documents| snapshot_of(tenant, documents))
    }

    pub fn event_geo(&self, tenant: Tenant) -> Vec<Option<GeoPoint>> {
        self.tenants
            .lock()
            .get(&tenant)
            .map(|documents| documents.events.iter().map(|(_, geo)| *geo).collect())
            .unwrap_or_default()
    }

    /// Makes `apply` fail for the given tenant without touching it.
    pub fn fail_apply_for(&self, tenant: Tenant) {
        *self.failing.lock() = Some(tenant);
    }
}

fn snapshot_of(tenant: Tenant, documents: &TenantDocuments) -> TenantSnapshot {
    TenantSnapshot {
        tenant,
        users: documents.users.clone(),
        connections: documents.connections.clone(),
        events: documents.events.iter().map(|(event, _)| event.clone()).collect(),
    }
}

fn not_found(tenant: Tenant, what: String) -> MigrationError {
    MigrationError::Operation(format!("{tenant}: {what} not found"))
}

impl MigrationStore for InMemoryMigrationStore {
    fn list_tenants(&self) -> BoxFuture<'_, Result<Vec<Tenant>, MigrationError>> {
        Box::pin(async move { Ok(self.tenants.lock().keys().copied().collect()) })
    }

    fn load(&self, tenant: Tenant) -> BoxFuture<'_, Result<TenantSnapshot, MigrationError>> {
        Box::pin(async move {
            self.snapshot(tenant)
                .ok_or_else(|| MigrationError::Operation(format!("schema {tenant} does not exist")))
        })
    }

    fn apply(&self, rewrite: &TenantRewrite) -> BoxFuture<'_, Result<u64, MigrationError>> {
        let rewrite = rewrite.clone();
        Box::pin(async move {
            let tenant = rewrite.tenant;
            if *self.failing.lock() == Some(tenant) {
                return Err(MigrationError::Unavailable("injected apply failure".into()));
            }
            let mut tenants = self.tenants.lock();
            let Some(current) = tenants.get(&tenant) else {
                return Err(not_found(tenant, "schema".into()));
            };
            // Work on a copy so a failed rewrite leaves the tenant untouched.
            let mut next = current.clone();

            for user in &rewrite.users {
                let slot = next
                    .users
                    .iter_mut()
                    .find(|doc| doc.get("id") == Some(&Value::from(user.old_id.as_str())))
                    .ok_or_else(|| not_found(tenant, format!("user '{}'", user.old_id)))?;
                *slot = user.document.clone();
            }
            for connection in &rewrite.connections {
                let slot = next
                    .connections
                    .iter_mut()
                    .find(|doc| {
                        doc.get("user_from_id") == Some(&connection.old_user_from_id)
                            && doc.get("user_to_id") == Some(&connection.old_user_to_id)
                            && doc.get("type").and_then(Value::as_str).unwrap_or_default()
                                == connection.kind
                    })
                    .ok_or_else(|| {
                        not_found(
                            tenant,
                            format!(
                                "connection {} -> {}",
                                connection.old_user_from_id, connection.old_user_to_id
                            ),
                        )
                    })?;
                *slot = connection.document.clone();
            }
            for event in &rewrite.events {
                let slot = next
                    .events
                    .iter_mut()
                    .find(|(doc, _)| doc.get("id") == Some(&Value::from(event.old_id.as_str())))
                    .ok_or_else(|| not_found(tenant, format!("event '{}'", event.old_id)))?;
                *slot = (event.document.clone(), event.geo);
            }

            let removed = next.sessions;
            next.sessions = 0;
            tenants.insert(tenant, next);
            Ok(removed)
        })
    }
}
