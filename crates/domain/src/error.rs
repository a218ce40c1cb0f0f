use thiserror::Error;

use crate::entities::Tenant;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unknown tenant {0}")]
    UnknownTenant(Tenant),
    #[error("stored document is malformed: {0}")]
    Corrupt(String),
}

impl DomainError {
    /// Errors worth retrying against the same record.
    pub fn is_transient(&self) -> bool {
        matches!(self, DomainError::Unavailable(_))
    }
}
