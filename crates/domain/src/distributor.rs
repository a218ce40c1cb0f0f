use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::appliers::{ApplierSet, Applied, Disposition, payload_tenant};
use crate::cursor::{CursorManager, CursorSummary};
use crate::envelope::{Record, Sequence};
use crate::log_reader::{DEFAULT_BATCH_LIMIT, LogReader, ReadRequest, ReaderExit};
use crate::observability;
use crate::ports::cursor::CursorError;
use crate::ports::log::LogError;
use crate::progress::{Outcome, ProgressEvent, ProgressTracker, Ticket};
use crate::util::backoff_ms;

#[derive(Clone, Debug)]
pub struct DistributorConfig {
    pub consumer_name: String,
    pub batch_limit: usize,
    /// 0 means one worker per available core.
    pub worker_count: usize,
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            consumer_name: "distributor".into(),
            batch_limit: DEFAULT_BATCH_LIMIT,
            worker_count: 0,
            max_workers: 16,
            queue_capacity: 256,
            retry_backoff_base_ms: 100,
            retry_backoff_max_ms: 10_000,
        }
    }
}

impl DistributorConfig {
    pub fn workers(&self) -> usize {
        let wanted = if self.worker_count == 0 {
            std::thread::available_parallelism()
                .map(|cores| cores.get())
                .unwrap_or(1)
        } else {
            self.worker_count
        };
        wanted.clamp(1, self.max_workers.max(1))
    }

    fn worker_queue(&self, workers: usize) -> usize {
        (self.queue_capacity / workers.max(1)).max(1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributorState {
    Init,
    Resolve,
    Consuming,
    Draining,
    Terminated,
}

impl DistributorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributorState::Init => "init",
            DistributorState::Resolve => "resolve",
            DistributorState::Consuming => "consuming",
            DistributorState::Draining => "draining",
            DistributorState::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Error)]
pub enum DistributorError {
    #[error("cursor: {0}")]
    Cursor(#[from] CursorError),
    #[error("log reader: {0}")]
    Reader(LogError),
    #[error("fatal apply failure: {0}")]
    Fatal(String),
    #[error("task failed: {0}")]
    Task(String),
}

/// Live counters read by the diagnostics endpoint.
pub struct DistributorStats {
    started_at: Instant,
    received: AtomicU64,
    applied: AtomicU64,
    unchanged: AtomicU64,
    skipped: AtomicU64,
    retried: AtomicU64,
    abandoned: AtomicU64,
    in_flight: AtomicU64,
    fetched: Mutex<Option<Sequence>>,
    eligible: Mutex<Option<Sequence>>,
    persisted: Mutex<Option<Sequence>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub received: u64,
    pub applied: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub retried: u64,
    pub abandoned: u64,
    pub in_flight: u64,
    pub fetched_position: Option<String>,
    pub eligible_position: Option<String>,
    pub persisted_position: Option<String>,
}

impl Default for DistributorStats {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            received: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            fetched: Mutex::new(None),
            eligible: Mutex::new(None),
            persisted: Mutex::new(None),
        }
    }
}

impl DistributorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let position = |slot: &Mutex<Option<Sequence>>| slot.lock().as_ref().map(|s| s.as_str().to_string());
        StatsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            fetched_position: position(&self.fetched),
            eligible_position: position(&self.eligible),
            persisted_position: position(&self.persisted),
        }
    }

    fn seed(&self, start: &Sequence) {
        let start = Some(start.clone()).filter(|sequence| !sequence.is_empty());
        Self::set_position(&self.eligible, start.clone());
        Self::set_position(&self.persisted, start);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn set_position(slot: &Mutex<Option<Sequence>>, sequence: Option<Sequence>) {
        *slot.lock() = sequence;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub received: u64,
    pub applied: u64,
    pub skipped: u64,
    pub abandoned: u64,
    pub cursor: CursorSummary,
}

struct Job {
    ticket: Ticket,
    record: Record,
}

#[derive(Clone)]
struct WorkerContext {
    appliers: Arc<ApplierSet>,
    stats: Arc<DistributorStats>,
    progress: mpsc::UnboundedSender<ProgressEvent>,
    run: CancellationToken,
    fatal: Arc<Mutex<Option<String>>>,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

/// The consuming role: cursor bootstrap, log reader, worker pool and cursor
/// persistence wired over bounded queues.
pub struct Distributor {
    reader: LogReader,
    cursor: Arc<CursorManager>,
    appliers: Arc<ApplierSet>,
    config: DistributorConfig,
    state: watch::Sender<DistributorState>,
    stats: Arc<DistributorStats>,
}

impl Distributor {
    pub fn new(
        reader: LogReader,
        cursor: CursorManager,
        appliers: ApplierSet,
        config: DistributorConfig,
    ) -> Self {
        let (state, _) = watch::channel(DistributorState::Init);
        Self {
            reader,
            cursor: Arc::new(cursor),
            appliers: Arc::new(appliers),
            config,
            state,
            stats: Arc::new(DistributorStats::default()),
        }
    }

    pub fn state(&self) -> watch::Receiver<DistributorState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<DistributorStats> {
        self.stats.clone()
    }

    fn transition(&self, next: DistributorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = previous.as_str(), to = next.as_str(), consumer = %self.config.consumer_name, "distributor state changed");
        }
    }

    /// Runs until `shutdown` fires or the run fails, then drains and
    /// terminates. The cursor only ever covers completed records.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunSummary, DistributorError> {
        self.transition(DistributorState::Resolve);
        let start = match self.cursor.resolve().await {
            Ok(start) => start,
            Err(err) => {
                error!(consumer = %self.config.consumer_name, error = %err, "cursor bootstrap failed");
                self.transition(DistributorState::Terminated);
                return Err(err.into());
            }
        };
        self.stats.seed(&start);

        self.transition(DistributorState::Consuming);
        let run = shutdown.child_token();
        let mut handles = self.reader.read(
            ReadRequest {
                consumer_id: self.config.consumer_name.clone(),
                starting_position: start,
                batch_limit: self.config.batch_limit,
            },
            run.clone(),
        );

        let (positions_tx, positions_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let cursor_task = {
            let cursor = self.cursor.clone();
            let run = run.clone();
            tokio::spawn(async move { cursor.run(positions_rx, run).await })
        };
        let persisted_task = self.spawn_persisted_mirror();

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let progress_task = spawn_progress(progress_rx, positions_tx, self.stats.clone());

        let fatal = Arc::new(Mutex::new(None));
        let context = WorkerContext {
            appliers: self.appliers.clone(),
            stats: self.stats.clone(),
            progress: progress_tx.clone(),
            run: run.clone(),
            fatal: fatal.clone(),
            backoff_base_ms: self.config.retry_backoff_base_ms,
            backoff_max_ms: self.config.retry_backoff_max_ms,
        };
        let workers = self.config.workers();
        let queue = self.config.worker_queue(workers);
        let mut senders = Vec::with_capacity(workers);
        let mut worker_tasks = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(queue);
            senders.push(tx);
            worker_tasks.push(tokio::spawn(run_worker(index, rx, context.clone())));
        }
        drop(context);
        info!(consumer = %self.config.consumer_name, workers, queue, "distributor consuming");

        let mut reader_fatal = None;
        let mut ticket: Ticket = 0;
        let mut draining = false;
        loop {
            tokio::select! {
                biased;
                _ = run.cancelled(), if !draining => {
                    draining = true;
                    self.transition(DistributorState::Draining);
                }
                Some(err) = handles.errors.recv() => {
                    if err.is_fatal() {
                        reader_fatal = Some(err);
                        run.cancel();
                    }
                }
                next = handles.records.recv() => {
                    let Some(record) = next else { break };
                    DistributorStats::bump(&self.stats.received);
                    DistributorStats::set_position(&self.stats.fetched, handles.positions.borrow().clone());
                    let _ = progress_tx.send(ProgressEvent::Dispatched {
                        ticket,
                        sequence: record.sequence.clone(),
                    });
                    let index = route(&record.partition_key, senders.len());
                    if senders[index].send(Job { ticket, record }).await.is_err() {
                        let _ = progress_tx.send(ProgressEvent::Finished { ticket, outcome: Outcome::Abandoned });
                        run.cancel();
                        break;
                    }
                    ticket += 1;
                }
            }
        }
        if !draining {
            self.transition(DistributorState::Draining);
        }
        run.cancel();

        drop(senders);
        for task in worker_tasks {
            if let Err(err) = task.await {
                error!(error = %err, "worker task failed");
            }
        }
        drop(progress_tx);
        if let Err(err) = progress_task.await {
            error!(error = %err, "progress task failed");
        }
        let cursor_result = cursor_task.await;
        persisted_task.abort();
        let reader_exit = handles.done.await.unwrap_or(ReaderExit::Fatal);
        while let Ok(err) = handles.errors.try_recv() {
            if err.is_fatal() && reader_fatal.is_none() {
                reader_fatal = Some(err);
            }
        }

        self.transition(DistributorState::Terminated);

        let cursor = match cursor_result {
            Ok(Ok(summary)) => summary,
            Ok(Err(err)) => return Err(err.into()),
            Err(err) => return Err(DistributorError::Task(err.to_string())),
        };
        DistributorStats::set_position(&self.stats.persisted, cursor.persisted.clone());
        if let Some(message) = fatal.lock().take() {
            return Err(DistributorError::Fatal(message));
        }
        if let Some(err) = reader_fatal {
            return Err(DistributorError::Reader(err));
        }
        if reader_exit == ReaderExit::Fatal {
            return Err(DistributorError::Task("log reader stopped unexpectedly".into()));
        }

        let snapshot = self.stats.snapshot();
        Ok(RunSummary {
            received: snapshot.received,
            applied: snapshot.applied + snapshot.unchanged,
            skipped: snapshot.skipped,
            abandoned: snapshot.abandoned,
            cursor,
        })
    }

    fn spawn_persisted_mirror(&self) -> JoinHandle<()> {
        let mut persisted = self.cursor.persisted();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            loop {
                let current = persisted.borrow_and_update().clone();
                DistributorStats::set_position(&stats.persisted, current);
                if persisted.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

/// Same partition key, same worker.
fn route(partition_key: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    partition_key.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

fn spawn_progress(
    mut events: mpsc::UnboundedReceiver<ProgressEvent>,
    positions: mpsc::Sender<Sequence>,
    stats: Arc<DistributorStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = ProgressTracker::new();
        while let Some(event) = events.recv().await {
            let released = tracker.observe(event);
            let in_flight = tracker.in_flight() as u64;
            stats.in_flight.store(in_flight, Ordering::Relaxed);
            observability::set_in_flight(in_flight);
            if let Some(sequence) = released {
                DistributorStats::set_position(&stats.eligible, Some(sequence.clone()));
                if positions.send(sequence).await.is_err() {
                    warn!("cursor manager gone, positions dropped");
                }
            }
        }
        if tracker.is_blocked() {
            info!(position = ?tracker.released(), "cursor held back by an unfinished record");
        }
    })
}

async fn run_worker(index: usize, mut jobs: mpsc::Receiver<Job>, context: WorkerContext) {
    debug!(worker = index, "worker started");
    // Later jobs here may share the abandoned record's partition key and
    // must not overtake it.
    let mut halted = false;
    while let Some(Job { ticket, record }) = jobs.recv().await {
        let outcome = if halted || context.fatal.lock().is_some() {
            DistributorStats::bump(&context.stats.abandoned);
            Outcome::Abandoned
        } else {
            apply_record(&context, &record).await
        };
        if outcome == Outcome::Abandoned {
            halted = true;
        }
        let _ = context
            .progress
            .send(ProgressEvent::Finished { ticket, outcome });
    }
    debug!(worker = index, "worker stopped");
}

async fn apply_record(context: &WorkerContext, record: &Record) -> Outcome {
    let started = Instant::now();
    let (channel, payload) = match record.decode() {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(
                sequence = %record.sequence,
                partition_key = %record.partition_key,
                error = %err,
                "skipping undecodable record"
            );
            observability::register_record("unknown", "skipped", elapsed_ms(started));
            DistributorStats::bump(&context.stats.skipped);
            return Outcome::Completed;
        }
    };

    let mut attempt = 0u32;
    loop {
        let err = match context.appliers.dispatch(channel, &payload).await {
            Ok(applied) => {
                let counter = match applied {
                    Applied::Written => &context.stats.applied,
                    Applied::Unchanged => &context.stats.unchanged,
                };
                DistributorStats::bump(counter);
                observability::register_record(channel.as_str(), "applied", elapsed_ms(started));
                debug!(channel = %channel, sequence = %record.sequence, ?applied, "record applied");
                return Outcome::Completed;
            }
            Err(err) => err,
        };

        match err.disposition() {
            Disposition::Skip => {
                warn!(
                    channel = %channel,
                    sequence = %record.sequence,
                    partition_key = %record.partition_key,
                    tenant = ?payload_tenant(&payload),
                    reason = err.reason(),
                    error = %err,
                    "skipping record"
                );
                if err.reason() == "validation" {
                    observability::register_validation_error(channel.as_str());
                }
                observability::register_record(channel.as_str(), "skipped", elapsed_ms(started));
                DistributorStats::bump(&context.stats.skipped);
                return Outcome::Completed;
            }
            Disposition::Retry => {
                attempt = attempt.saturating_add(1);
                let delay = backoff_ms(context.backoff_base_ms, attempt, context.backoff_max_ms);
                warn!(
                    channel = %channel,
                    sequence = %record.sequence,
                    attempt,
                    delay_ms = delay,
                    error = %err,
                    "apply failed, retrying"
                );
                observability::register_record(channel.as_str(), "retried", elapsed_ms(started));
                DistributorStats::bump(&context.stats.retried);
                tokio::select! {
                    biased;
                    _ = context.run.cancelled() => {
                        info!(channel = %channel, sequence = %record.sequence, "retry interrupted by shutdown");
                        DistributorStats::bump(&context.stats.abandoned);
                        return Outcome::Abandoned;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                }
            }
            Disposition::Fatal => {
                error!(
                    channel = %channel,
                    sequence = %record.sequence,
                    reason = err.reason(),
                    error = %err,
                    "fatal apply failure"
                );
                observability::register_record(channel.as_str(), "failed", elapsed_ms(started));
                DistributorStats::bump(&context.stats.abandoned);
                context.fatal.lock().get_or_insert_with(|| err.to_string());
                context.run.cancel();
                return Outcome::Abandoned;
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}
