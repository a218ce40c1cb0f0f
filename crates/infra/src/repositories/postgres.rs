use std::sync::Arc;

use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tapglue_domain::DomainResult;
use tapglue_domain::entities::{
    Account, AccountUser, Application, ApplicationUser, Connection, ConnectionKey, Event, Tenant,
};
use tapglue_domain::error::DomainError;
use tapglue_domain::ports::BoxFuture;
use tapglue_domain::ports::store::{
    AccountStore, AccountUserStore, ApplicationStore, ApplicationUserStore, ConnectionStore,
    EventStore, Stores,
};
use time::OffsetDateTime;

use crate::db::{PostgresClient, store_error};

/// Merged into `json_data` on soft delete.
const SOFT_DELETE: &str = "json_data || jsonb_build_object(\
     'enabled', false, \
     'deleted', true, \
     'updated_at', to_char(now() AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.US\"Z\"'))";

/// Soft deletes leave already deleted rows untouched.
const LIVE: &str = "COALESCE((json_data ->> 'deleted')::boolean, false) = false";

const EVENT_GEO: &str = "CASE WHEN $2::float8 IS NULL OR $3::float8 IS NULL THEN NULL \
     ELSE ST_SetSRID(ST_MakePoint($2, $3), 4326) END";

/// Qualified name of a table inside a tenant namespace.
fn tenant_table(tenant: Tenant, table: &str) -> String {
    format!("\"{}\".{table}", tenant.schema())
}

/// Statements creating the namespace of a tenant, safe to rerun.
pub(crate) fn tenant_ddl(tenant: Tenant) -> Vec<String> {
    let schema = tenant.schema();
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""),
        format!(
            "CREATE TABLE IF NOT EXISTS \"{schema}\".users (\
             json_data JSONB NOT NULL, \
             last_read TIMESTAMP DEFAULT '2015-05-01 01:23:45' NOT NULL)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS \"{schema}\".events (\
             json_data JSONB NOT NULL, \
             geo GEOMETRY(POINT, 4326))"
        ),
        format!("CREATE TABLE IF NOT EXISTS \"{schema}\".connections (json_data JSONB NOT NULL)"),
        format!(
            "CREATE TABLE IF NOT EXISTS \"{schema}\".sessions (\
             user_id CHAR(36) NOT NULL, \
             session_id CHAR(40) NOT NULL, \
             created_at TIMESTAMP DEFAULT now() NOT NULL, \
             enabled BOOL DEFAULT TRUE NOT NULL)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS users_json ON \"{schema}\".users USING GIN (json_data jsonb_path_ops)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS events_json ON \"{schema}\".events USING GIN (json_data jsonb_path_ops)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS connections_json ON \"{schema}\".connections USING GIN (json_data jsonb_path_ops)"
        ),
        format!("CREATE INDEX IF NOT EXISTS events_geo ON \"{schema}\".events USING GIST (geo)"),
    ]
}

async fn provision_tenant(tx: &mut Transaction<'_, Postgres>, tenant: Tenant) -> DomainResult<()> {
    for statement in tenant_ddl(tenant) {
        sqlx::query(&statement)
            .execute(&mut **tx)
            .await
            .map_err(|err| store_error(err, None))?;
    }
    tracing::info!(tenant = %tenant, "tenant namespace provisioned");
    Ok(())
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Every entity store backed by postgres. Writes go to the main pool,
/// reads to a replica.
#[derive(Clone)]
pub struct PostgresStores {
    client: PostgresClient,
}

impl PostgresStores {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }

    pub fn stores(&self) -> Stores {
        let shared = Arc::new(self.clone());
        Stores {
            accounts: shared.clone(),
            account_users: shared.clone(),
            applications: shared.clone(),
            application_users: shared.clone(),
            connections: shared.clone(),
            events: shared,
        }
    }

    fn main(&self) -> &PgPool {
        self.client.main()
    }

    fn replica(&self) -> &PgPool {
        self.client.replica()
    }

    async fn account_on(&self, pool: &PgPool, account_id: i64) -> DomainResult<Option<Account>> {
        let row: Option<(i64, Json<Account>)> =
            sqlx::query_as("SELECT id, json_data FROM tg.accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(pool)
                .await
                .map_err(|err| store_error(err, None))?;
        Ok(row.map(|(id, Json(mut account))| {
            account.account_id = id;
            account
        }))
    }

    async fn account_user_on(
        &self,
        pool: &PgPool,
        account_id: i64,
        public_id: &str,
    ) -> DomainResult<Option<AccountUser>> {
        let row: Option<(i64, Json<AccountUser>)> = sqlx::query_as(
            "SELECT id, json_data FROM tg.account_users \
             WHERE account_id = $1 AND json_data ->> 'id' = $2",
        )
        .bind(account_id)
        .bind(public_id)
        .fetch_optional(pool)
        .await
        .map_err(|err| store_error(err, None))?;
        Ok(row.map(|(id, Json(mut user))| {
            user.account_user_id = id;
            user
        }))
    }

    async fn application_on(
        &self,
        pool: &PgPool,
        tenant: Tenant,
    ) -> DomainResult<Option<Application>> {
        let row: Option<(Json<Application>,)> = sqlx::query_as(
            "SELECT json_data FROM tg.applications WHERE account_id = $1 AND id = $2",
        )
        .bind(tenant.account_id)
        .bind(tenant.application_id)
        .fetch_optional(pool)
        .await
        .map_err(|err| store_error(err, None))?;
        Ok(row.map(|(Json(application),)| application))
    }

    async fn application_user_on(
        &self,
        pool: &PgPool,
        tenant: Tenant,
        user_id: u64,
    ) -> DomainResult<Option<ApplicationUser>> {
        let sql = format!(
            "SELECT json_data FROM {} WHERE json_data ->> 'id' = $1 LIMIT 1",
            tenant_table(tenant, "users")
        );
        let row: Option<(Json<ApplicationUser>,)> = sqlx::query_as(&sql)
            .bind(user_id.to_string())
            .fetch_optional(pool)
            .await
            .map_err(|err| store_error(err, Some(tenant)))?;
        Ok(row.map(|(Json(user),)| user))
    }

    async fn connection_on(
        &self,
        pool: &PgPool,
        tenant: Tenant,
        key: ConnectionKey,
    ) -> DomainResult<Option<Connection>> {
        let sql = format!(
            "SELECT json_data FROM {} \
             WHERE json_data ->> 'user_from_id' = $1 \
             AND json_data ->> 'user_to_id' = $2 \
             AND json_data ->> 'type' = $3 LIMIT 1",
            tenant_table(tenant, "connections")
        );
        let row: Option<(Json<Connection>,)> = sqlx::query_as(&sql)
            .bind(key.user_from_id.to_string())
            .bind(key.user_to_id.to_string())
            .bind(key.kind.as_str())
            .fetch_optional(pool)
            .await
            .map_err(|err| store_error(err, Some(tenant)))?;
        Ok(row.map(|(Json(connection),)| connection))
    }

    async fn event_on(
        &self,
        pool: &PgPool,
        tenant: Tenant,
        user_id: u64,
        event_id: u64,
    ) -> DomainResult<Option<Event>> {
        let sql = format!(
            "SELECT json_data FROM {} \
             WHERE json_data ->> 'user_id' = $1 AND json_data ->> 'id' = $2 LIMIT 1",
            tenant_table(tenant, "events")
        );
        let row: Option<(Json<Event>,)> = sqlx::query_as(&sql)
            .bind(user_id.to_string())
            .bind(event_id.to_string())
            .fetch_optional(pool)
            .await
            .map_err(|err| store_error(err, Some(tenant)))?;
        Ok(row.map(|(Json(event),)| event))
    }
}

fn vanished(what: &str) -> DomainError {
    DomainError::Unavailable(format!("{what} not readable after write"))
}

impl AccountStore for PostgresStores {
    fn create(&self, account: &Account) -> BoxFuture<'_, DomainResult<Account>> {
        let mut account = account.clone();
        Box::pin(async move {
            account.common.stamp_created(now());
            sqlx::query(
                "INSERT INTO tg.accounts (id, json_data) SELECT $1, $2 \
                 WHERE NOT EXISTS (SELECT 1 FROM tg.accounts WHERE id = $1)",
            )
            .bind(account.account_id)
            .bind(Json(&account))
            .execute(self.main())
            .await
            .map_err(|err| store_error(err, None))?;
            self.account_on(self.main(), account.account_id)
                .await?
                .ok_or_else(|| vanished("account"))
        })
    }

    fn read(&self, account_id: i64) -> BoxFuture<'_, DomainResult<Option<Account>>> {
        Box::pin(async move { self.account_on(self.replica(), account_id).await })
    }

    fn update(&self, account: &Account) -> BoxFuture<'_, DomainResult<Account>> {
        let account = account.clone();
        Box::pin(async move {
            let result = sqlx::query("UPDATE tg.accounts SET json_data = $2 WHERE id = $1")
                .bind(account.account_id)
                .bind(Json(&account))
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, None))?;
            if result.rows_affected() == 0 {
                return Err(DomainError::NotFound);
            }
            Ok(account)
        })
    }

    fn delete(&self, account_id: i64) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE tg.accounts SET json_data = {SOFT_DELETE} WHERE id = $1 AND {LIVE}"
            );
            sqlx::query(&sql)
                .bind(account_id)
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, None))?;
            Ok(())
        })
    }
}

impl AccountUserStore for PostgresStores {
    fn create(&self, user: &AccountUser) -> BoxFuture<'_, DomainResult<AccountUser>> {
        let mut user = user.clone();
        Box::pin(async move {
            if user.public_id.is_empty() {
                return Err(DomainError::Validation("account user without public id".into()));
            }
            if let Some(existing) = self
                .account_user_on(self.main(), user.account_id, &user.public_id)
                .await?
            {
                return Ok(existing);
            }
            if !user.profile.email.is_empty() {
                let taken: Option<(i64,)> = sqlx::query_as(
                    "SELECT id FROM tg.account_users \
                     WHERE account_id = $1 AND lower(json_data ->> 'email') = lower($2) LIMIT 1",
                )
                .bind(user.account_id)
                .bind(&user.profile.email)
                .fetch_optional(self.main())
                .await
                .map_err(|err| store_error(err, None))?;
                if taken.is_some() {
                    return Err(DomainError::Conflict);
                }
            }

            user.common.stamp_created(now());
            sqlx::query(
                "INSERT INTO tg.account_users (account_id, json_data) SELECT $1, $2 \
                 WHERE NOT EXISTS (SELECT 1 FROM tg.account_users \
                 WHERE account_id = $1 AND json_data ->> 'id' = $3)",
            )
            .bind(user.account_id)
            .bind(Json(&user))
            .bind(&user.public_id)
            .execute(self.main())
            .await
            .map_err(|err| store_error(err, None))?;
            self.account_user_on(self.main(), user.account_id, &user.public_id)
                .await?
                .ok_or_else(|| vanished("account user"))
        })
    }

    fn read(
        &self,
        account_id: i64,
        public_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<AccountUser>>> {
        let public_id = public_id.to_string();
        Box::pin(async move {
            self.account_user_on(self.replica(), account_id, &public_id)
                .await
        })
    }

    fn update(&self, user: &AccountUser) -> BoxFuture<'_, DomainResult<AccountUser>> {
        let user = user.clone();
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE tg.account_users SET json_data = $3 \
                 WHERE account_id = $1 AND json_data ->> 'id' = $2",
            )
            .bind(user.account_id)
            .bind(&user.public_id)
            .bind(Json(&user))
            .execute(self.main())
            .await
            .map_err(|err| store_error(err, None))?;
            if result.rows_affected() == 0 {
                return Err(DomainError::NotFound);
            }
            Ok(user)
        })
    }

    fn delete(&self, account_id: i64, public_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let public_id = public_id.to_string();
        Box::pin(async move {
            let sql = format!(
                "UPDATE tg.account_users SET json_data = {SOFT_DELETE} \
                 WHERE account_id = $1 AND json_data ->> 'id' = $2 AND {LIVE}"
            );
            sqlx::query(&sql)
                .bind(account_id)
                .bind(&public_id)
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, None))?;
            Ok(())
        })
    }

    fn destroy_sessions(
        &self,
        account_id: i64,
        public_id: &str,
    ) -> BoxFuture<'_, DomainResult<u64>> {
        let public_id = public_id.to_string();
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM tg.account_user_sessions \
                 WHERE account_id = $1 AND account_user_id IN (\
                 SELECT id FROM tg.account_users WHERE account_id = $1 AND json_data ->> 'id' = $2)",
            )
            .bind(account_id)
            .bind(&public_id)
            .execute(self.main())
            .await
            .map_err(|err| store_error(err, None))?;
            Ok(result.rows_affected())
        })
    }
}

impl ApplicationStore for PostgresStores {
    fn create(&self, application: &Application) -> BoxFuture<'_, DomainResult<Application>> {
        let mut application = application.clone();
        Box::pin(async move {
            let tenant = application.tenant();
            application.common.stamp_created(now());

            let mut tx = self
                .main()
                .begin()
                .await
                .map_err(|err| store_error(err, None))?;
            sqlx::query(
                "INSERT INTO tg.applications (id, account_id, json_data) SELECT $1, $2, $3 \
                 WHERE NOT EXISTS (SELECT 1 FROM tg.applications WHERE id = $1 AND account_id = $2)",
            )
            .bind(tenant.application_id)
            .bind(tenant.account_id)
            .bind(Json(&application))
            .execute(&mut *tx)
            .await
            .map_err(|err| store_error(err, None))?;
            provision_tenant(&mut tx, tenant).await?;
            tx.commit().await.map_err(|err| store_error(err, None))?;

            self.application_on(self.main(), tenant)
                .await?
                .ok_or_else(|| vanished("application"))
        })
    }

    fn read(&self, tenant: Tenant) -> BoxFuture<'_, DomainResult<Option<Application>>> {
        Box::pin(async move { self.application_on(self.replica(), tenant).await })
    }

    fn update(&self, application: &Application) -> BoxFuture<'_, DomainResult<Application>> {
        let application = application.clone();
        Box::pin(async move {
            let tenant = application.tenant();
            let result = sqlx::query(
                "UPDATE tg.applications SET json_data = $3 WHERE account_id = $1 AND id = $2",
            )
            .bind(tenant.account_id)
            .bind(tenant.application_id)
            .bind(Json(&application))
            .execute(self.main())
            .await
            .map_err(|err| store_error(err, None))?;
            if result.rows_affected() == 0 {
                return Err(DomainError::NotFound);
            }
            Ok(application)
        })
    }

    fn delete(&self, tenant: Tenant) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE tg.applications SET json_data = {SOFT_DELETE} \
                 WHERE account_id = $1 AND id = $2 AND {LIVE}"
            );
            sqlx::query(&sql)
                .bind(tenant.account_id)
                .bind(tenant.application_id)
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, None))?;
            Ok(())
        })
    }
}

impl ApplicationUserStore for PostgresStores {
    fn create(&self, user: &ApplicationUser) -> BoxFuture<'_, DomainResult<ApplicationUser>> {
        let mut user = user.clone();
        Box::pin(async move {
            if user.id == 0 {
                return Err(DomainError::Validation("application user without id".into()));
            }
            let tenant = user.tenant();
            user.common.stamp_created(now());
            let table = tenant_table(tenant, "users");
            let sql = format!(
                "INSERT INTO {table} (json_data) SELECT $1 \
                 WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE json_data ->> 'id' = $2)"
            );
            sqlx::query(&sql)
                .bind(Json(&user))
                .bind(user.id.to_string())
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, Some(tenant)))?;
            self.application_user_on(self.main(), tenant, user.id)
                .await?
                .ok_or_else(|| vanished("application user"))
        })
    }

    fn read(
        &self,
        tenant: Tenant,
        user_id: u64,
    ) -> BoxFuture<'_, DomainResult<Option<ApplicationUser>>> {
        Box::pin(async move {
            self.application_user_on(self.replica(), tenant, user_id)
                .await
        })
    }

    fn update(&self, user: &ApplicationUser) -> BoxFuture<'_, DomainResult<ApplicationUser>> {
        let user = user.clone();
        Box::pin(async move {
            let tenant = user.tenant();
            let sql = format!(
                "UPDATE {} SET json_data = $1 WHERE json_data ->> 'id' = $2",
                tenant_table(tenant, "users")
            );
            let result = sqlx::query(&sql)
                .bind(Json(&user))
                .bind(user.id.to_string())
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, Some(tenant)))?;
            if result.rows_affected() == 0 {
                return Err(DomainError::NotFound);
            }
            Ok(user)
        })
    }

    fn delete(&self, tenant: Tenant, user_id: u64) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE {} SET json_data = {SOFT_DELETE} \
                 WHERE json_data ->> 'id' = $1 AND {LIVE}",
                tenant_table(tenant, "users")
            );
            sqlx::query(&sql)
                .bind(user_id.to_string())
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, Some(tenant)))?;
            Ok(())
        })
    }

    fn find_by_social_ids(
        &self,
        tenant: Tenant,
        platform: &str,
        social_ids: &[String],
    ) -> BoxFuture<'_, DomainResult<Vec<ApplicationUser>>> {
        let platform = platform.to_string();
        let social_ids = social_ids.to_vec();
        Box::pin(async move {
            if social_ids.is_empty() {
                return Ok(Vec::new());
            }
            let sql = format!(
                "SELECT json_data FROM {} \
                 WHERE json_data -> 'social_ids' ->> $1 = ANY($2) \
                 AND NOT COALESCE((json_data ->> 'deleted')::boolean, false) \
                 ORDER BY (json_data ->> 'id')::numeric",
                tenant_table(tenant, "users")
            );
            let rows: Vec<(Json<ApplicationUser>,)> = sqlx::query_as(&sql)
                .bind(&platform)
                .bind(&social_ids)
                .fetch_all(self.replica())
                .await
                .map_err(|err| store_error(err, Some(tenant)))?;
            Ok(rows.into_iter().map(|(Json(user),)| user).collect())
        })
    }

    fn destroy_sessions(&self, tenant: Tenant, user_id: u64) -> BoxFuture<'_, DomainResult<u64>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE {} SET enabled = FALSE WHERE user_id = $1 AND enabled",
                tenant_table(tenant, "sessions")
            );
            let result = sqlx::query(&sql)
                .bind(user_id.to_string())
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, Some(tenant)))?;
            Ok(result.rows_affected())
        })
    }
}

impl ConnectionStore for PostgresStores {
    fn create(&self, connection: &Connection) -> BoxFuture<'_, DomainResult<Connection>> {
        let mut connection = connection.clone().normalized();
        Box::pin(async move {
            let tenant = connection.tenant();
            let key = connection.key();
            connection.common.stamp_created(now());
            let table = tenant_table(tenant, "connections");
            let sql = format!(
                "INSERT INTO {table} (json_data) SELECT $1 \
                 WHERE NOT EXISTS (SELECT 1 FROM {table} \
                 WHERE json_data ->> 'user_from_id' = $2 \
                 AND json_data ->> 'user_to_id' = $3 \
                 AND json_data ->> 'type' = $4)"
            );
            sqlx::query(&sql)
                .bind(Json(&connection))
                .bind(key.user_from_id.to_string())
                .bind(key.user_to_id.to_string())
                .bind(key.kind.as_str())
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, Some(tenant)))?;
            self.connection_on(self.main(), tenant, key)
                .await?
                .ok_or_else(|| vanished("connection"))
        })
    }

    fn read(
        &self,
        tenant: Tenant,
        key: ConnectionKey,
    ) -> BoxFuture<'_, DomainResult<Option<Connection>>> {
        Box::pin(async move { self.connection_on(self.replica(), tenant, key).await })
    }

    fn update(&self, connection: &Connection) -> BoxFuture<'_, DomainResult<Connection>> {
        let connection = connection.clone().normalized();
        Box::pin(async move {
            let tenant = connection.tenant();
            let key = connection.key();
            let sql = format!(
                "UPDATE {} SET json_data = $1 \
                 WHERE json_data ->> 'user_from_id' = $2 \
                 AND json_data ->> 'user_to_id' = $3 \
                 AND json_data ->> 'type' = $4",
                tenant_table(tenant, "connections")
            );
            let result = sqlx::query(&sql)
                .bind(Json(&connection))
                .bind(key.user_from_id.to_string())
                .bind(key.user_to_id.to_string())
                .bind(key.kind.as_str())
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, Some(tenant)))?;
            if result.rows_affected() == 0 {
                return Err(DomainError::NotFound);
            }
            Ok(connection)
        })
    }

    fn delete(&self, tenant: Tenant, key: ConnectionKey) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE {} SET json_data = {SOFT_DELETE} \
                 WHERE json_data ->> 'user_from_id' = $1 \
                 AND json_data ->> 'user_to_id' = $2 \
                 AND json_data ->> 'type' = $3 AND {LIVE}",
                tenant_table(tenant, "connections")
            );
            sqlx::query(&sql)
                .bind(key.user_from_id.to_string())
                .bind(key.user_to_id.to_string())
                .bind(key.kind.as_str())
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, Some(tenant)))?;
            Ok(())
        })
    }
}

impl EventStore for PostgresStores {
    fn create(&self, event: &Event) -> BoxFuture<'_, DomainResult<Event>> {
        let mut event = event.clone();
        Box::pin(async move {
            if event.id == 0 {
                return Err(DomainError::Validation("event without id".into()));
            }
            let tenant = event.tenant();
            event.common.stamp_created(now());
            let table = tenant_table(tenant, "events");
            let sql = format!(
                "INSERT INTO {table} (json_data, geo) SELECT $1, {EVENT_GEO} \
                 WHERE NOT EXISTS (SELECT 1 FROM {table} \
                 WHERE json_data ->> 'user_id' = $4 AND json_data ->> 'id' = $5)"
            );
            sqlx::query(&sql)
                .bind(Json(&event))
                .bind(event.longitude)
                .bind(event.latitude)
                .bind(event.user_id.to_string())
                .bind(event.id.to_string())
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, Some(tenant)))?;
            self.event_on(self.main(), tenant, event.user_id, event.id)
                .await?
                .ok_or_else(|| vanished("event"))
        })
    }

    fn read(
        &self,
        tenant: Tenant,
        user_id: u64,
        event_id: u64,
    ) -> BoxFuture<'_, DomainResult<Option<Event>>> {
        Box::pin(async move {
            self.event_on(self.replica(), tenant, user_id, event_id)
                .await
        })
    }

    fn update(&self, event: &Event) -> BoxFuture<'_, DomainResult<Event>> {
        let event = event.clone();
        Box::pin(async move {
            let tenant = event.tenant();
            let sql = format!(
                "UPDATE {} SET json_data = $1, geo = {EVENT_GEO} \
                 WHERE json_data ->> 'user_id' = $4 AND json_data ->> 'id' = $5",
                tenant_table(tenant, "events")
            );
            let result = sqlx::query(&sql)
                .bind(Json(&event))
                .bind(event.longitude)
                .bind(event.latitude)
                .bind(event.user_id.to_string())
                .bind(event.id.to_string())
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, Some(tenant)))?;
            if result.rows_affected() == 0 {
                return Err(DomainError::NotFound);
            }
            Ok(event)
        })
    }

    fn delete(&self, tenant: Tenant, user_id: u64, event_id: u64) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE {} SET json_data = {SOFT_DELETE} \
                 WHERE json_data ->> 'user_id' = $1 AND json_data ->> 'id' = $2 AND {LIVE}",
                tenant_table(tenant, "events")
            );
            sqlx::query(&sql)
                .bind(user_id.to_string())
                .bind(event_id.to_string())
                .execute(self.main())
                .await
                .map_err(|err| store_error(err, Some(tenant)))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_tables_are_quoted_and_namespaced() {
        let tenant = Tenant::new(4, 9);
        assert_eq!(tenant_table(tenant, "users"), "\"app_4_9\".users");
    }

    #[test]
    fn tenant_ddl_creates_every_table() {
        let statements = tenant_ddl(Tenant::new(1, 2));
        assert_eq!(statements[0], "CREATE SCHEMA IF NOT EXISTS \"app_1_2\"");
        for table in ["users", "events", "connections", "sessions"] {
            assert!(
                statements
                    .iter()
                    .any(|statement| statement.starts_with(&format!(
                        "CREATE TABLE IF NOT EXISTS \"app_1_2\".{table}"
                    ))),
                "missing {table}"
            );
        }
        assert!(statements.iter().all(|statement| statement.contains("IF NOT EXISTS")));
    }

    #[test]
    fn soft_delete_fragment_sets_flags() {
        assert!(SOFT_DELETE.contains("'deleted', true"));
        assert!(SOFT_DELETE.contains("'enabled', false"));
        assert!(LIVE.contains("'deleted'"));
    }
}
