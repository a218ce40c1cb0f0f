use serde_json::Value;
use sqlx::types::Json;
use tapglue_domain::entities::Tenant;
use tapglue_domain::ports::BoxFuture;
use tapglue_domain::ports::migration::{
    MigrationError, MigrationStore, TenantRewrite, TenantSnapshot,
};

use crate::db::PostgresClient;

const TENANT_PATTERN: &str = "app_%_%";

/// Tenant namespaces as raw documents, rewritten in one transaction each.
#[derive(Clone)]
pub struct PostgresMigrationStore {
    client: PostgresClient,
}

impl PostgresMigrationStore {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }

    async fn documents(&self, tenant: Tenant, table: &str) -> Result<Vec<Value>, MigrationError> {
        let sql = format!("SELECT json_data FROM \"{}\".{table}", tenant.schema());
        let rows: Vec<(Json<Value>,)> = sqlx::query_as(&sql)
            .fetch_all(self.client.main())
            .await
            .map_err(migration_error)?;
        Ok(rows.into_iter().map(|(Json(document),)| document).collect())
    }
}

fn migration_error(err: sqlx::Error) -> MigrationError {
    match err {
        sqlx::Error::Database(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            MigrationError::Operation(err.to_string())
        }
        other => MigrationError::Unavailable(other.to_string()),
    }
}

fn untouched(tenant: Tenant, what: String) -> MigrationError {
    MigrationError::Operation(format!("{tenant}: {what} not found"))
}

/// Schema names matching the catalog pattern that really are tenants.
fn parse_tenants(names: Vec<String>) -> Vec<Tenant> {
    let mut tenants: Vec<Tenant> = names
        .into_iter()
        .filter_map(|name| {
            let tenant = Tenant::parse_schema(&name);
            if tenant.is_none() {
                tracing::warn!(schema = %name, "ignoring schema that is not a tenant namespace");
            }
            tenant
        })
        .collect();
    tenants.sort();
    tenants.dedup();
    tenants
}

impl MigrationStore for PostgresMigrationStore {
    fn list_tenants(&self) -> BoxFuture<'_, Result<Vec<Tenant>, MigrationError>> {
        Box::pin(async move {
            let names: Vec<(String,)> = sqlx::query_as(
                "SELECT nspname::text FROM pg_catalog.pg_namespace WHERE nspname ILIKE $1",
            )
            .bind(TENANT_PATTERN)
            .fetch_all(self.client.main())
            .await
            .map_err(migration_error)?;
            Ok(parse_tenants(names.into_iter().map(|(name,)| name).collect()))
        })
    }

    fn load(&self, tenant: Tenant) -> BoxFuture<'_, Result<TenantSnapshot, MigrationError>> {
        Box::pin(async move {
            Ok(TenantSnapshot {
                tenant,
                users: self.documents(tenant, "users").await?,
                connections: self.documents(tenant, "connections").await?,
                events: self.documents(tenant, "events").await?,
            })
        })
    }

    fn apply(&self, rewrite: &TenantRewrite) -> BoxFuture<'_, Result<u64, MigrationError>> {
        let rewrite = rewrite.clone();
        Box::pin(async move {
            let tenant = rewrite.tenant;
            let schema = tenant.schema();
            let mut tx = self.client.main().begin().await.map_err(migration_error)?;

            let users_sql = format!(
                "UPDATE \"{schema}\".users SET json_data = $1 WHERE json_data -> 'id' = to_jsonb($2::text)"
            );
            for user in &rewrite.users {
                let result = sqlx::query(&users_sql)
                    .bind(Json(&user.document))
                    .bind(&user.old_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(migration_error)?;
                if result.rows_affected() == 0 {
                    return Err(untouched(tenant, format!("user '{}'", user.old_id)));
                }
            }

            let connections_sql = format!(
                "UPDATE \"{schema}\".connections SET json_data = $1 \
                 WHERE json_data -> 'user_from_id' = $2 \
                 AND json_data -> 'user_to_id' = $3 \
                 AND COALESCE(json_data ->> 'type', '') = $4"
            );
            for connection in &rewrite.connections {
                let result = sqlx::query(&connections_sql)
                    .bind(Json(&connection.document))
                    .bind(Json(&connection.old_user_from_id))
                    .bind(Json(&connection.old_user_to_id))
                    .bind(&connection.kind)
                    .execute(&mut *tx)
                    .await
                    .map_err(migration_error)?;
                if result.rows_affected() == 0 {
                    return Err(untouched(
                        tenant,
                        format!(
                            "connection {} -> {}",
                            connection.old_user_from_id, connection.old_user_to_id
                        ),
                    ));
                }
            }

            let events_sql = format!(
                "UPDATE \"{schema}\".events SET json_data = $1, geo = ST_GeomFromText($3, 4326) \
                 WHERE json_data -> 'id' = to_jsonb($2::text)"
            );
            for event in &rewrite.events {
                let result = sqlx::query(&events_sql)
                    .bind(Json(&event.document))
                    .bind(&event.old_id)
                    .bind(event.geo.map(|point| point.wkt()))
                    .execute(&mut *tx)
                    .await
                    .map_err(migration_error)?;
                if result.rows_affected() == 0 {
                    return Err(untouched(tenant, format!("event '{}'", event.old_id)));
                }
            }

            let sessions = sqlx::query(&format!("DELETE FROM \"{schema}\".sessions"))
                .execute(&mut *tx)
                .await
                .map_err(migration_error)?;
            tx.commit().await.map_err(migration_error)?;
            Ok(sessions.rows_affected())
        })
    }
}
