use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::envelope::Sequence;
use crate::observability;
use crate::ports::cursor::{CursorError, CursorStore};

const FINAL_FLUSH_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CursorSummary {
    pub persisted: Option<Sequence>,
    pub persists: u64,
    pub failures: u64,
}

/// Owns the `consumers` row of one consumer: bootstraps it and persists
/// the highest eligible position on a fixed cadence.
pub struct CursorManager {
    store: Arc<dyn CursorStore>,
    consumer: String,
    flush_interval: Duration,
    persisted: watch::Sender<Option<Sequence>>,
}

impl CursorManager {
    pub fn new(store: Arc<dyn CursorStore>, consumer: impl Into<String>, flush_interval: Duration) -> Self {
        let (persisted, _) = watch::channel(None);
        Self {
            store,
            consumer: consumer.into(),
            flush_interval,
            persisted,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Last position known to be stored.
    pub fn persisted(&self) -> watch::Receiver<Option<Sequence>> {
        self.persisted.subscribe()
    }

    /// Reads the cursor row, inserting the empty-position row when absent.
    /// An empty position means the log's trim horizon.
    pub async fn resolve(&self) -> Result<Sequence, CursorError> {
        let position = match self.store.load(&self.consumer).await? {
            Some(position) => position,
            None => {
                info!(consumer = %self.consumer, "cursor row missing, creating");
                self.store.create(&self.consumer).await?;
                self.store.load(&self.consumer).await?.unwrap_or_default()
            }
        };
        info!(consumer = %self.consumer, position = %position, "cursor resolved");
        self.persisted.send_replace(Some(position.clone()));
        Ok(position)
    }

    /// Persists positions until `positions` closes, then flushes once more.
    /// After `shutdown` fires the ticker stops; the channel is drained and
    /// the final position written once.
    pub async fn run(
        &self,
        mut positions: mpsc::Receiver<Sequence>,
        shutdown: CancellationToken,
    ) -> Result<CursorSummary, CursorError> {
        let mut summary = CursorSummary {
            persisted: self.persisted.borrow().clone(),
            ..CursorSummary::default()
        };
        let mut highest = summary.persisted.clone();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut draining = false;

        loop {
            tokio::select! {
                biased;
                next = positions.recv() => match next {
                    Some(sequence) => raise(&mut highest, sequence),
                    None => break,
                },
                _ = shutdown.cancelled(), if !draining => {
                    debug!(consumer = %self.consumer, "cursor manager draining");
                    draining = true;
                }
                _ = ticker.tick(), if !draining => {
                    let _ = self.flush(&highest, &mut summary).await;
                }
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.flush(&highest, &mut summary).await {
                Ok(()) => break,
                Err(err) if attempt >= FINAL_FLUSH_ATTEMPTS => return Err(err),
                Err(_) => tokio::time::sleep(self.flush_interval).await,
            }
        }
        info!(
            consumer = %self.consumer,
            position = ?summary.persisted,
            persists = summary.persists,
            "cursor manager stopped"
        );
        Ok(summary)
    }

    async fn flush(&self, highest: &Option<Sequence>, summary: &mut CursorSummary) -> Result<(), CursorError> {
        let Some(candidate) = highest else {
            return Ok(());
        };
        if summary
            .persisted
            .as_ref()
            .is_some_and(|persisted| persisted >= candidate)
        {
            return Ok(());
        }

        match self.store.save(&self.consumer, candidate).await {
            Ok(()) => {
                debug!(consumer = %self.consumer, position = %candidate, "cursor persisted");
                observability::register_cursor_persist("ok");
                summary.persisted = Some(candidate.clone());
                summary.persists += 1;
                self.persisted.send_replace(Some(candidate.clone()));
                Ok(())
            }
            Err(err) => {
                error!(consumer = %self.consumer, position = %candidate, error = %err, "cursor persist failed");
                observability::register_cursor_persist("error");
                summary.failures += 1;
                Err(err)
            }
        }
    }
}

fn raise(highest: &mut Option<Sequence>, sequence: Sequence) {
    match highest {
        Some(current) if *current >= sequence => {
            if *current > sequence {
                warn!(position = %sequence, highest = %current, "ignoring position below the eligible cursor");
            }
        }
        _ => *highest = Some(sequence),
    }
}
