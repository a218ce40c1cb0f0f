use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tapglue_domain::ids::{AllocatorConfig, IdAllocator};
use tapglue_domain::migration::{Migration, MigrationMode, MigrationReport};
use tapglue_infra::config::{AppConfig, MIGRATION_CONFIG_ENV};
use tapglue_infra::db::{PgConfig, PostgresClient};
use tapglue_infra::logging::init_tracing;
use tapglue_infra::repositories::{PostgresCounterStore, PostgresMigrationStore};
use tracing::{error, info, warn};

/// Rewrites string ids of every tenant into allocator-issued numeric ids.
#[derive(Debug, Parser)]
#[command(name = "migrate", version)]
struct Cli {
    /// Apply the rewrite; without it the tool only reports the plan.
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true"
    )]
    run: bool,
}

impl Cli {
    fn mode(&self) -> MigrationMode {
        if self.run {
            MigrationMode::Apply
        } else {
            MigrationMode::DryRun
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(MIGRATION_CONFIG_ENV)?;
    init_tracing(&config)?;
    let mode = cli.mode();

    if mode == MigrationMode::Apply {
        for _ in 0..3 {
            warn!("LAUNCHING WITH ACTIVE CHANGES MODE!!!");
        }
        warn!(
            delay_secs = config.migration_abort_delay_secs,
            "if you don't want to continue you have {} seconds to abort",
            config.migration_abort_delay_secs
        );
        tokio::time::sleep(Duration::from_secs(config.migration_abort_delay_secs)).await;
    }

    let client = PostgresClient::connect(&PgConfig::from_app_config(&config)).await?;
    client.ensure_schema().await?;
    let allocator = Arc::new(IdAllocator::new(
        Arc::new(PostgresCounterStore::new(client.clone())),
        allocator_config(&config),
    ));
    let renewal = allocator.spawn_renewal();
    let migration = Migration::new(
        Arc::new(PostgresMigrationStore::new(client.clone())),
        allocator.clone(),
    );

    info!(mode = ?mode, "migration starting");
    let result = migration.run(mode).await;
    allocator.release_all().await;
    if let Err(err) = renewal.await {
        warn!(error = %err, "lease renewal task failed");
    }
    client.close().await;

    match result {
        Ok(report) => {
            print_report(&report)?;
            info!(
                tenants = report.tenants.len(),
                skipped = report.tenants_skipped.len(),
                "migration finished"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "migration aborted");
            Err(err.into())
        }
    }
}

fn allocator_config(config: &AppConfig) -> AllocatorConfig {
    let owner = format!("migrate:{}:{}", config.machine_id, std::process::id());
    let mut allocator = AllocatorConfig::new(config.machine_id, owner);
    allocator.reserve_ms = config.id_reserve_ms;
    allocator.lease_ttl = Duration::from_millis(config.id_lease_ttl_ms);
    allocator
}

fn print_report(report: &MigrationReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
