pub mod appliers;
pub mod channel;
pub mod cursor;
pub mod distributor;
pub mod entities;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod journal;
pub mod log_reader;
pub mod memory;
pub mod migration;
pub mod observability;
pub mod ports;
pub mod progress;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
