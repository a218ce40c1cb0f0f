use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tapglue_domain::entities::Tenant;
use tapglue_domain::error::DomainError;
use tapglue_domain::ports::BoxFuture;
use tapglue_domain::ports::db::{DbAdapter, DbError};
use url::Url;

use crate::config::AppConfig;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const BASE_SCHEMA: &str = include_str!("../../sql/schema.sql");

#[derive(Debug, Clone)]
pub struct PgConfig {
    pub main_url: String,
    pub replica_urls: Vec<String>,
    pub max_connections: u32,
}

impl PgConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            main_url: config.postgres_url.clone(),
            replica_urls: config.replica_urls(),
            max_connections: config.postgres_max_connections.max(1),
        }
    }
}

/// Main pool for writes plus optional read replicas picked round-robin.
#[derive(Clone)]
pub struct PostgresClient {
    main: PgPool,
    replicas: Arc<Vec<PgPool>>,
    next_replica: Arc<AtomicUsize>,
    endpoint: String,
}

impl PostgresClient {
    pub async fn connect(config: &PgConfig) -> Result<Self, DbError> {
        let main = open_pool(&config.main_url, config.max_connections).await?;
        let mut replicas = Vec::with_capacity(config.replica_urls.len());
        for url in &config.replica_urls {
            replicas.push(open_pool(url, config.max_connections).await?);
        }
        tracing::info!(
            endpoint = %redact(&config.main_url),
            replicas = replicas.len(),
            "postgres pools ready"
        );
        Ok(Self {
            main,
            replicas: Arc::new(replicas),
            next_replica: Arc::new(AtomicUsize::new(0)),
            endpoint: redact(&config.main_url),
        })
    }

    pub fn from_pools(main: PgPool, replicas: Vec<PgPool>) -> Self {
        Self {
            main,
            replicas: Arc::new(replicas),
            next_replica: Arc::new(AtomicUsize::new(0)),
            endpoint: String::from("<pool>"),
        }
    }

    pub fn main(&self) -> &PgPool {
        &self.main
    }

    /// Pool for reads; the main pool when no replica is configured.
    pub fn replica(&self) -> &PgPool {
        if self.replicas.is_empty() {
            return &self.main;
        }
        let index = self.next_replica.fetch_add(1, Ordering::Relaxed) % self.replicas.len();
        &self.replicas[index]
    }

    /// Creates the global tables, the cursor table and the allocator table
    /// when they are missing.
    pub async fn ensure_schema(&self) -> Result<(), DbError> {
        sqlx::raw_sql(BASE_SCHEMA)
            .execute(&self.main)
            .await
            .map_err(|err| DbError::Operation(format!("schema bootstrap failed: {err}")))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.main.close().await;
        for replica in self.replicas.iter() {
            replica.close().await;
        }
    }
}

async fn open_pool(url: &str, max_connections: u32) -> Result<PgPool, DbError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(url)
        .await
        .map_err(|err| DbError::Unavailable(format!("connect to {} failed: {err}", redact(url))))
}

impl DbAdapter for PostgresClient {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.main)
                .await
                .map_err(|err| DbError::Unavailable(err.to_string()))?;
            tracing::debug!(endpoint = %self.endpoint, "postgres health check succeeded");
            Ok(())
        })
    }
}

/// Connection string safe to log.
pub fn redact(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => String::from("<invalid url>"),
    }
}

pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_error) => db_error.code().map(|code| code.into_owned()),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("23505")
}

/// Maps a driver error onto the store taxonomy. Missing schemas or tables
/// of a tenant namespace mean the tenant does not exist.
pub(crate) fn store_error(err: sqlx::Error, tenant: Option<Tenant>) -> DomainError {
    match (sqlstate(&err).as_deref(), tenant) {
        (Some("3F000" | "42P01"), Some(tenant)) => DomainError::UnknownTenant(tenant),
        (Some("23505"), _) => DomainError::Conflict,
        (Some("23502" | "23514" | "22P02"), _) => DomainError::Validation(err.to_string()),
        (Some(_), _) => DomainError::Corrupt(err.to_string()),
        (None, _) => match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DomainError::Corrupt(err.to_string())
            }
            other => DomainError::Unavailable(other.to_string()),
        },
    }
}
