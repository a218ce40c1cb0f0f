use thiserror::Error;

use super::BoxFuture;
use crate::envelope::Sequence;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor store unavailable: {0}")]
    Unavailable(String),
    #[error("cursor row for '{0}' is missing")]
    Missing(String),
    #[error("cursor operation failed: {0}")]
    Operation(String),
}

/// Persistence of the `consumers` row of one logical consumer.
pub trait CursorStore: Send + Sync {
    fn load(&self, consumer: &str) -> BoxFuture<'_, Result<Option<Sequence>, CursorError>>;
    /// Inserts the empty-position row. A concurrent insert by another
    /// instance is not an error.
    fn create(&self, consumer: &str) -> BoxFuture<'_, Result<(), CursorError>>;
    fn save(&self, consumer: &str, position: &Sequence) -> BoxFuture<'_, Result<(), CursorError>>;
}
