use thiserror::Error;

use super::BoxFuture;
use crate::envelope::{Envelope, Record, Sequence};

#[derive(Debug, Error)]
pub enum LogError {
    /// Transport glitches and throttling; the fetch is retried.
    #[error("log temporarily unavailable: {0}")]
    Transient(String),
    /// Authentication failures and unknown streams; the reader stops.
    #[error("log failed permanently: {0}")]
    Fatal(String),
    #[error("log serialization error: {0}")]
    Serialization(String),
}

impl LogError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, LogError::Fatal(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LogError::Transient(_) => "transient",
            LogError::Fatal(_) => "fatal",
            LogError::Serialization(_) => "serialization",
        }
    }
}

/// Read side of the request journal, bound to one stream shard.
pub trait LogSource: Send + Sync {
    fn stream(&self) -> &str;
    /// Next page strictly after `after` (from the trim horizon when `None`
    /// or empty), in log order.
    fn fetch(
        &self,
        after: Option<&Sequence>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Record>, LogError>>;
}

/// Write side used by the frontend.
pub trait LogProducer: Send + Sync {
    fn publish(
        &self,
        partition_key: &str,
        envelope: &Envelope,
    ) -> BoxFuture<'_, Result<Sequence, LogError>>;
}
