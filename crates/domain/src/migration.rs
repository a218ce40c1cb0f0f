//! One-shot rewrite of opaque string ids into allocator-issued numeric ids.
//!
//! Every tenant is planned in memory first: users and events with string
//! ids get fresh ids from the allocator, and every reference to them in
//! connections and events is rewritten through the same maps. Applying a
//! plan is all-or-nothing per tenant and also drops the tenant's sessions.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::entities::{GeoPoint, Tenant};
use crate::ids::IdAllocator;
use crate::ports::counter::IdKind;
use crate::ports::migration::{
    ConnectionRewrite, EventRewrite, MigrationError, MigrationStore, TenantRewrite, TenantSnapshot,
    UserRewrite,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    DryRun,
    Apply,
}

/// Planned rewrite of one tenant together with the id maps it was built from.
#[derive(Clone, Debug, PartialEq)]
pub struct TenantPlan {
    pub rewrite: TenantRewrite,
    pub user_ids: BTreeMap<String, u64>,
    pub event_ids: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TenantReport {
    pub tenant: String,
    pub users: usize,
    pub connections: usize,
    pub events: usize,
    pub users_remapped: usize,
    pub connections_rewritten: usize,
    pub events_remapped: usize,
    /// `None` in dry-run mode.
    pub sessions_removed: Option<u64>,
    pub user_ids: BTreeMap<String, u64>,
    pub event_ids: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub mode: MigrationMode,
    pub tenants_found: usize,
    /// Tenants without users are left alone.
    pub tenants_skipped: Vec<String>,
    pub tenants: Vec<TenantReport>,
}

fn string_id(document: &Value, field: &str) -> Option<String> {
    document.get(field)?.as_str().map(str::to_string)
}

fn remap(
    tenant: Tenant,
    kind: &'static str,
    users: &BTreeMap<String, u64>,
    document: &mut Value,
    field: &str,
) -> Result<bool, MigrationError> {
    let Some(old) = string_id(document, field) else {
        return Ok(false);
    };
    let Some(new) = users.get(&old) else {
        return Err(MigrationError::DanglingReference {
            tenant,
            kind,
            user_id: old,
        });
    };
    document[field] = Value::from(*new);
    Ok(true)
}

fn event_geo(document: &Value) -> Option<GeoPoint> {
    let latitude = document.get("latitude")?.as_f64()?;
    let longitude = document.get("longitude")?.as_f64()?;
    Some(GeoPoint {
        latitude,
        longitude,
    })
}

async fn allocate_ids(
    tenant: Tenant,
    documents: &[Value],
    kind: IdKind,
    allocator: &IdAllocator,
) -> Result<BTreeMap<String, u64>, MigrationError> {
    let mut ids = BTreeMap::new();
    for document in documents {
        let Some(old) = string_id(document, "id") else {
            continue;
        };
        if ids.contains_key(&old) {
            return Err(MigrationError::Malformed {
                tenant,
                reason: format!("duplicate {} id '{old}'", kind.as_str()),
            });
        }
        let new = allocator.next_id(tenant.application_id, kind).await?;
        ids.insert(old, new);
    }
    Ok(ids)
}

/// Builds the rewrite of one tenant. Numeric ids are left untouched;
/// string ids are replaced, and every document that referenced one is
/// rewritten.
pub async fn plan_tenant(
    snapshot: &TenantSnapshot,
    allocator: &IdAllocator,
) -> Result<TenantPlan, MigrationError> {
    let tenant = snapshot.tenant;
    let user_ids = allocate_ids(tenant, &snapshot.users, IdKind::Users, allocator).await?;
    let event_ids = allocate_ids(tenant, &snapshot.events, IdKind::Events, allocator).await?;

    let mut users = Vec::new();
    for document in &snapshot.users {
        let Some(old_id) = string_id(document, "id") else {
            continue;
        };
        let mut document = document.clone();
        document["id"] = Value::from(user_ids[&old_id]);
        users.push(UserRewrite { old_id, document });
    }

    let mut connections = Vec::new();
    for original in &snapshot.connections {
        let mut document = original.clone();
        let from = remap(tenant, "connection", &user_ids, &mut document, "user_from_id")?;
        let to = remap(tenant, "connection", &user_ids, &mut document, "user_to_id")?;
        if !(from || to) {
            continue;
        }
        connections.push(ConnectionRewrite {
            old_user_from_id: original.get("user_from_id").cloned().unwrap_or(Value::Null),
            old_user_to_id: original.get("user_to_id").cloned().unwrap_or(Value::Null),
            kind: original
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            document,
        });
    }

    let mut events = Vec::new();
    for original in &snapshot.events {
        let Some(old_id) = string_id(original, "id") else {
            continue;
        };
        let mut document = original.clone();
        document["id"] = Value::from(event_ids[&old_id]);
        remap(tenant, "event", &user_ids, &mut document, "user_id")?;
        events.push(EventRewrite {
            old_id,
            geo: event_geo(&document),
            document,
        });
    }

    Ok(TenantPlan {
        rewrite: TenantRewrite {
            tenant,
            users,
            connections,
            events,
        },
        user_ids,
        event_ids,
    })
}

pub struct Migration {
    store: Arc<dyn MigrationStore>,
    allocator: Arc<IdAllocator>,
}

impl Migration {
    pub fn new(store: Arc<dyn MigrationStore>, allocator: Arc<IdAllocator>) -> Self {
        Self { store, allocator }
    }

    /// Walks every tenant. In `Apply` mode the first failing tenant aborts
    /// the run; tenants applied before it stay migrated.
    pub async fn run(&self, mode: MigrationMode) -> Result<MigrationReport, MigrationError> {
        let mut tenants = self.store.list_tenants().await?;
        tenants.sort();
        info!(count = tenants.len(), ?mode, "migrating tenants");

        let mut report = MigrationReport {
            mode,
            tenants_found: tenants.len(),
            tenants_skipped: Vec::new(),
            tenants: Vec::new(),
        };

        for tenant in tenants {
            let snapshot = self.store.load(tenant).await?;
            if snapshot.users.is_empty() {
                report.tenants_skipped.push(tenant.schema());
                continue;
            }

            let plan = plan_tenant(&snapshot, &self.allocator).await?;
            let sessions_removed = match mode {
                MigrationMode::DryRun => None,
                MigrationMode::Apply => match self.store.apply(&plan.rewrite).await {
                    Ok(removed) => Some(removed),
                    Err(err) => {
                        warn!(tenant = %tenant, error = %err, "tenant migration failed, aborting");
                        return Err(err);
                    }
                },
            };

            let tenant_report = TenantReport {
                tenant: tenant.schema(),
                users: snapshot.users.len(),
                connections: snapshot.connections.len(),
                events: snapshot.events.len(),
                users_remapped: plan.rewrite.users.len(),
                connections_rewritten: plan.rewrite.connections.len(),
                events_remapped: plan.rewrite.events.len(),
                sessions_removed,
                user_ids: plan.user_ids,
                event_ids: plan.event_ids,
            };
            info!(
                tenant = %tenant,
                account_id = tenant.account_id,
                application_id = tenant.application_id,
                users = tenant_report.users_remapped,
                connections = tenant_report.connections_rewritten,
                events = tenant_report.events_remapped,
                sessions_removed = ?tenant_report.sessions_removed,
                "tenant migrated"
            );
            report.tenants.push(tenant_report);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AllocatorConfig;
    use crate::memory::InMemoryCounterStore;
    use serde_json::json;

    fn allocator() -> IdAllocator {
        IdAllocator::new(
            Arc::new(InMemoryCounterStore::new()),
            AllocatorConfig::new(1, "migration-test"),
        )
    }

    fn snapshot() -> TenantSnapshot {
        TenantSnapshot {
            tenant: Tenant::new(1, 1),
            users: vec![
                json!({"id": "U1", "user_name": "one"}),
                json!({"id": "U2", "user_name": "two"}),
                json!({"id": 77, "user_name": "already numeric"}),
            ],
            connections: vec![
                json!({"user_from_id": "U1", "user_to_id": "U2", "type": "friend"}),
                json!({"user_from_id": 77, "user_to_id": 78, "type": "follow"}),
            ],
            events: vec![json!({
                "id": "E1",
                "user_id": "U2",
                "verb": "like",
                "latitude": 52.5,
                "longitude": 13.4
            })],
        }
    }

    #[tokio::test]
    async fn plan_rewrites_ids_and_references() {
        let plan = plan_tenant(&snapshot(), &allocator()).await.unwrap();
        let u1 = plan.user_ids["U1"];
        let u2 = plan.user_ids["U2"];
        assert_ne!(u1, u2);
        assert_eq!(plan.rewrite.users.len(), 2);

        assert_eq!(plan.rewrite.connections.len(), 1);
        let connection = &plan.rewrite.connections[0];
        assert_eq!(connection.old_user_from_id, json!("U1"));
        assert_eq!(connection.kind, "friend");
        assert_eq!(connection.document["user_from_id"], json!(u1));
        assert_eq!(connection.document["user_to_id"], json!(u2));

        let event = &plan.rewrite.events[0];
        assert_eq!(event.document["id"], json!(plan.event_ids["E1"]));
        assert_eq!(event.document["user_id"], json!(u2));
        assert_eq!(
            event.geo,
            Some(GeoPoint {
                latitude: 52.5,
                longitude: 13.4
            })
        );
    }

    #[tokio::test]
    async fn dangling_reference_fails_the_plan() {
        let mut snapshot = snapshot();
        snapshot.connections.push(json!({"user_from_id": "U1", "user_to_id": "ghost", "type": "follow"}));
        let err = plan_tenant(&snapshot, &allocator()).await.unwrap_err();
        assert!(matches!(err, MigrationError::DanglingReference { ref user_id, .. } if user_id == "ghost"));
    }

    #[tokio::test]
    async fn duplicate_string_ids_are_rejected() {
        let mut snapshot = snapshot();
        snapshot.users.push(json!({"id": "U1"}));
        let err = plan_tenant(&snapshot, &allocator()).await.unwrap_err();
        assert!(matches!(err, MigrationError::Malformed { .. }));
    }
}
