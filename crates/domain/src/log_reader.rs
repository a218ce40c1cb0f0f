use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::envelope::{Record, Sequence};
use crate::observability;
use crate::ports::log::{LogError, LogSource};
use crate::util::backoff_ms;

pub const DEFAULT_BATCH_LIMIT: usize = 50;

#[derive(Clone, Debug)]
pub struct ReadRequest {
    pub consumer_id: String,
    /// Empty means the trim horizon.
    pub starting_position: Sequence,
    pub batch_limit: usize,
}

#[derive(Clone, Debug)]
pub struct ReaderConfig {
    /// Wait after an empty page.
    pub poll_interval: Duration,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            backoff_base_ms: 250,
            backoff_max_ms: 30_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderExit {
    Cancelled,
    /// Downstream dropped the records channel.
    Closed,
    Fatal,
}

/// Outputs of a running reader. `records` closes when the reader stops.
pub struct ReadHandles {
    pub records: mpsc::Receiver<Record>,
    /// Highest sequence handed downstream so far.
    pub positions: watch::Receiver<Option<Sequence>>,
    pub errors: mpsc::UnboundedReceiver<LogError>,
    pub done: JoinHandle<ReaderExit>,
}

#[derive(Clone)]
pub struct LogReader {
    source: Arc<dyn LogSource>,
    config: ReaderConfig,
}

impl LogReader {
    pub fn new(source: Arc<dyn LogSource>, config: ReaderConfig) -> Self {
        Self { source, config }
    }

    pub fn stream(&self) -> &str {
        self.source.stream()
    }

    /// Spawns the fetch loop. Cancelling `cancel` stops fetching; records
    /// already handed over stay in the channel for the consumer to drain.
    pub fn read(&self, request: ReadRequest, cancel: CancellationToken) -> ReadHandles {
        let batch_limit = request.batch_limit.max(1);
        let (records_tx, records) = mpsc::channel(batch_limit);
        let (positions_tx, positions) = watch::channel(None);
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let source = self.source.clone();
        let config = self.config.clone();

        let done = tokio::spawn(async move {
            let stream = source.stream().to_string();
            info!(
                stream = %stream,
                consumer = %request.consumer_id,
                position = %request.starting_position,
                "log reader starting"
            );
            let mut after = Some(request.starting_position).filter(|sequence| !sequence.is_empty());
            let mut attempt = 0u32;

            loop {
                let fetched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return ReaderExit::Cancelled,
                    fetched = source.fetch(after.as_ref(), batch_limit) => fetched,
                };

                match fetched {
                    Ok(page) if page.is_empty() => {
                        attempt = 0;
                        tokio::select! {
                            _ = cancel.cancelled() => return ReaderExit::Cancelled,
                            _ = tokio::time::sleep(config.poll_interval) => {}
                        }
                    }
                    Ok(page) => {
                        attempt = 0;
                        debug!(stream = %stream, count = page.len(), "fetched records");
                        for record in page {
                            let sequence = record.sequence.clone();
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => return ReaderExit::Cancelled,
                                sent = records_tx.send(record) => {
                                    if sent.is_err() {
                                        return ReaderExit::Closed;
                                    }
                                }
                            }
                            positions_tx.send_if_modified(|current| {
                                if current.as_ref().is_some_and(|seen| *seen >= sequence) {
                                    return false;
                                }
                                *current = Some(sequence.clone());
                                true
                            });
                            after = Some(sequence);
                        }
                    }
                    Err(err) if err.is_fatal() => {
                        error!(stream = %stream, error = %err, "log reader failed");
                        observability::register_reader_error(err.kind());
                        let _ = errors_tx.send(err);
                        return ReaderExit::Fatal;
                    }
                    Err(err) => {
                        attempt = attempt.saturating_add(1);
                        let delay = backoff_ms(config.backoff_base_ms, attempt, config.backoff_max_ms);
                        warn!(
                            stream = %stream,
                            attempt,
                            delay_ms = delay,
                            error = %err,
                            "log fetch failed, retrying"
                        );
                        observability::register_reader_error(err.kind());
                        let _ = errors_tx.send(err);
                        tokio::select! {
                            _ = cancel.cancelled() => return ReaderExit::Cancelled,
                            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        }
                    }
                }
            }
        });

        ReadHandles {
            records,
            positions,
            errors,
            done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryLog, MemoryLogFault};

    fn reader(log: &MemoryLog) -> LogReader {
        LogReader::new(
            Arc::new(log.clone()),
            ReaderConfig {
                poll_interval: Duration::from_millis(5),
                backoff_base_ms: 1,
                backoff_max_ms: 5,
            },
        )
    }

    fn request(start: Sequence, batch_limit: usize) -> ReadRequest {
        ReadRequest {
            consumer_id: "test".into(),
            starting_position: start,
            batch_limit,
        }
    }

    #[tokio::test]
    async fn reads_everything_after_the_start_in_order() {
        let log = MemoryLog::new("requests");
        let mut sequences = Vec::new();
        for index in 0..7 {
            sequences.push(log.append_raw("p", format!("record-{index}")));
        }

        let cancel = CancellationToken::new();
        let mut handles = reader(&log).read(request(sequences[1].clone(), 2), cancel.clone());
        let mut seen = Vec::new();
        while seen.len() < 5 {
            let record = handles.records.recv().await.unwrap();
            seen.push(record.sequence);
        }
        assert_eq!(seen, sequences[2..].to_vec());

        cancel.cancel();
        assert_eq!(handles.done.await.unwrap(), ReaderExit::Cancelled);
        assert_eq!(*handles.positions.borrow(), Some(sequences[6].clone()));
    }

    #[tokio::test]
    async fn transient_errors_are_reported_and_retried() {
        let log = MemoryLog::new("requests");
        let sequence = log.append_raw("p", "only");
        log.inject(MemoryLogFault::Transient);
        log.inject(MemoryLogFault::Transient);

        let cancel = CancellationToken::new();
        let mut handles = reader(&log).read(request(Sequence::default(), 10), cancel.clone());
        let record = handles.records.recv().await.unwrap();
        assert_eq!(record.sequence, sequence);
        assert!(matches!(handles.errors.recv().await, Some(LogError::Transient(_))));
        assert!(matches!(handles.errors.recv().await, Some(LogError::Transient(_))));
        cancel.cancel();
    }

    #[tokio::test]
    async fn fatal_error_closes_records_once() {
        let log = MemoryLog::new("requests");
        log.inject(MemoryLogFault::Fatal);

        let mut handles = reader(&log).read(request(Sequence::default(), 10), CancellationToken::new());
        assert!(handles.records.recv().await.is_none());
        assert!(matches!(handles.errors.recv().await, Some(LogError::Fatal(_))));
        assert!(handles.errors.recv().await.is_none());
        assert_eq!(handles.done.await.unwrap(), ReaderExit::Fatal);
    }
}
