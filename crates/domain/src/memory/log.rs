use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::envelope::{Envelope, Record, Sequence};
use crate::ports::BoxFuture;
use crate::ports::log::{LogError, LogProducer, LogSource};

/// Failure served by the next fetch instead of records.
#[derive(Clone, Debug)]
pub enum MemoryLogFault {
    Transient,
    Fatal,
    /// Serve the page starting at the given sequence again, once.
    Replay(Sequence),
}

#[derive(Default)]
struct LogState {
    records: Vec<Record>,
    faults: VecDeque<MemoryLogFault>,
}

/// Single-shard log kept in memory. Sequences are zero-padded counters.
#[derive(Clone)]
pub struct MemoryLog {
    stream: String,
    state: Arc<Mutex<LogState>>,
    fetches: Arc<AtomicUsize>,
}

impl MemoryLog {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            state: Arc::new(Mutex::new(LogState::default())),
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Appends raw record data, bypassing envelope encoding.
    pub fn append_raw(&self, partition_key: &str, data: impl Into<String>) -> Sequence {
        let mut state = self.state.lock();
        let sequence = Sequence::new(format!("{:020}", state.records.len() + 1));
        state
            .records
            .push(Record::new(sequence.clone(), partition_key, data));
        sequence
    }

    pub fn inject(&self, fault: MemoryLogFault) {
        self.state.lock().faults.push_back(fault);
    }

    pub fn records(&self) -> Vec<Record> {
        self.state.lock().records.clone()
    }

    pub fn last_sequence(&self) -> Option<Sequence> {
        self.state
            .lock()
            .records
            .last()
            .map(|record| record.sequence.clone())
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl LogSource for MemoryLog {
    fn stream(&self) -> &str {
        &self.stream
    }

    fn fetch(
        &self,
        after: Option<&Sequence>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Record>, LogError>> {
        let after = after.cloned().filter(|sequence| !sequence.is_empty());
        let state = self.state.clone();
        let fetches = self.fetches.clone();
        Box::pin(async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            let mut state = state.lock();
            let page = |records: &[Record], pick: &dyn Fn(&Record) -> bool| {
                records
                    .iter()
                    .filter(|record| pick(record))
                    .take(limit.max(1))
                    .cloned()
                    .collect::<Vec<_>>()
            };
            match state.faults.pop_front() {
                Some(MemoryLogFault::Transient) => {
                    Err(LogError::Transient("injected transient failure".into()))
                }
                Some(MemoryLogFault::Fatal) => Err(LogError::Fatal("injected fatal failure".into())),
                Some(MemoryLogFault::Replay(from)) => {
                    Ok(page(&state.records, &|record| record.sequence >= from))
                }
                None => Ok(page(&state.records, &|record| match &after {
                    Some(after) => record.sequence > *after,
                    None => true,
                })),
            }
        })
    }
}

impl LogProducer for MemoryLog {
    fn publish(
        &self,
        partition_key: &str,
        envelope: &Envelope,
    ) -> BoxFuture<'_, Result<Sequence, LogError>> {
        let partition_key = partition_key.to_string();
        let data = envelope.to_json();
        Box::pin(async move {
            let data = data.map_err(|err| LogError::Serialization(err.to_string()))?;
            Ok(self.append_raw(&partition_key, data))
        })
    }
}
