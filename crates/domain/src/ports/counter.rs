use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::BoxFuture;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdKind {
    Users,
    Events,
    Applications,
}

impl IdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdKind::Users => "users",
            IdKind::Events => "events",
            IdKind::Applications => "applications",
        }
    }
}

/// Allocation namespace. Application ids live under `application_id = 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatorKey {
    pub application_id: i64,
    pub kind: IdKind,
}

impl AllocatorKey {
    pub fn new(application_id: i64, kind: IdKind) -> Self {
        Self {
            application_id,
            kind,
        }
    }
}

impl fmt::Display for AllocatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application_id, self.kind.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("id allocator store unavailable: {0}")]
    Unavailable(String),
    #[error("lease on {0} is held by another process")]
    LeaseHeld(AllocatorKey),
    #[error("lease on {0} was lost")]
    LeaseLost(AllocatorKey),
    #[error("id space of {0} is exhausted")]
    Exhausted(AllocatorKey),
    #[error("id allocator operation failed: {0}")]
    Operation(String),
}

/// Persistent per-key horizon, reserved in batches under an exclusive lease.
pub trait CounterStore: Send + Sync {
    /// Takes the lease for `owner` and returns the persisted horizon. Fails
    /// with `LeaseHeld` while another owner's lease is live.
    fn acquire(
        &self,
        key: AllocatorKey,
        owner: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<u64, AllocatorError>>;
    /// Moves the horizon forward and renews the lease. Fails with
    /// `LeaseLost` when `owner` no longer holds it.
    fn advance(
        &self,
        key: AllocatorKey,
        owner: &str,
        horizon: u64,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), AllocatorError>>;
    fn release(&self, key: AllocatorKey, owner: &str) -> BoxFuture<'_, Result<(), AllocatorError>>;
}
