mod diagnostics;
mod observability;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use tapglue_domain::appliers::ApplierSet;
use tapglue_domain::cursor::CursorManager;
use tapglue_domain::distributor::{Distributor, DistributorConfig, DistributorState};
use tapglue_domain::log_reader::{LogReader, ReaderConfig};
use tapglue_infra::config::{AppConfig, DISTRIBUTOR_CONFIG_ENV};
use tapglue_infra::db::{PgConfig, PostgresClient};
use tapglue_infra::log::RedisStreamLog;
use tapglue_infra::logging::init_tracing;
use tapglue_infra::repositories::{PostgresCursorStore, PostgresStores};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EXIT_USAGE: i32 = 64;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Target {
    Postgres,
}

/// Applies the request journal to the authoritative store.
#[derive(Debug, Parser)]
#[command(name = "distributor", version)]
struct Cli {
    /// Store the journal is applied to.
    #[arg(long, value_enum)]
    target: Target,
}

fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            std::process::exit(EXIT_USAGE);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_cli();
    let config = AppConfig::load(DISTRIBUTOR_CONFIG_ENV)?;
    init_tracing(&config)?;
    observability::init_metrics()?;
    info!(
        target_store = ?cli.target,
        consumer = %config.consumer_name,
        stream = %config.stream_key(),
        "distributor starting"
    );

    let client = PostgresClient::connect(&PgConfig::from_app_config(&config)).await?;
    client.ensure_schema().await?;
    let log = Arc::new(RedisStreamLog::from_config(&config).await?);
    let stores = PostgresStores::new(client.clone());

    let reader = LogReader::new(
        log,
        ReaderConfig {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            backoff_base_ms: config.reader_backoff_base_ms,
            backoff_max_ms: config.reader_backoff_max_ms,
        },
    );
    let cursor = CursorManager::new(
        Arc::new(PostgresCursorStore::new(client.clone())),
        config.consumer_name.clone(),
        Duration::from_millis(config.cursor_flush_interval_ms),
    );
    let appliers = ApplierSet::new(stores.stores());
    let distributor = Distributor::new(reader, cursor, appliers, distributor_config(&config));

    let shutdown = CancellationToken::new();
    let state = distributor.state();
    tokio::spawn(follow_state(state.clone()));

    let diagnostics = diagnostics::router(diagnostics::DiagnosticsState {
        environment: config.app_env.clone(),
        consumer: config.consumer_name.clone(),
        state,
        stats: distributor.stats(),
        db: Arc::new(client.clone()),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.diagnostics_port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "diagnostics listening");
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, diagnostics)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        })
    };

    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), shutdown.clone()));

    let result = distributor.run(shutdown.clone()).await;
    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "diagnostics server exited with an error"),
        Err(err) => warn!(error = %err, "diagnostics server task failed"),
    }
    client.close().await;

    match result {
        Ok(summary) => {
            info!(
                received = summary.received,
                applied = summary.applied,
                skipped = summary.skipped,
                abandoned = summary.abandoned,
                persisted = ?summary.cursor.persisted,
                "distributor stopped"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "distributor failed");
            Err(err.into())
        }
    }
}

fn distributor_config(config: &AppConfig) -> DistributorConfig {
    DistributorConfig {
        consumer_name: config.consumer_name.clone(),
        batch_limit: config.batch_limit,
        worker_count: config.worker_count,
        max_workers: config.max_workers,
        queue_capacity: config.queue_capacity,
        retry_backoff_base_ms: config.retry_backoff_base_ms,
        retry_backoff_max_ms: config.retry_backoff_max_ms,
    }
}

/// Cancels `shutdown` once `signal` fires. A signal that cannot be listened
/// for leaves the run going.
async fn cancel_on_signal<F>(signal: F, shutdown: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("shutdown signal received");
            shutdown.cancel();
        }
        Err(err) => error!(error = %err, "failed to listen for the shutdown signal"),
    }
}

async fn follow_state(mut state: watch::Receiver<DistributorState>) {
    loop {
        observability::set_state(*state.borrow_and_update());
        if state.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_required_and_closed() {
        assert!(Cli::try_parse_from(["distributor", "--target=postgres"]).is_ok());
        let missing = Cli::try_parse_from(["distributor"]).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::MissingRequiredArgument);
        let unknown = Cli::try_parse_from(["distributor", "--target=kinesis"]).unwrap_err();
        assert_eq!(unknown.kind(), ErrorKind::InvalidValue);
    }

    #[tokio::test]
    async fn signal_listener_failure_keeps_running() {
        let shutdown = CancellationToken::new();
        let failed = async { Err(std::io::Error::other("no signal handler")) };
        cancel_on_signal(failed, shutdown.clone()).await;
        assert!(!shutdown.is_cancelled());

        cancel_on_signal(async { Ok(()) }, shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }
}
