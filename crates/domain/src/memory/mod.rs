//! In-memory adapters for every port. They back the scenario tests and the
//! local development setup.

mod counter;
mod cursor;
mod log;
mod migration;
mod stores;

pub use counter::InMemoryCounterStore;
pub use cursor::InMemoryCursorStore;
pub use log::{MemoryLog, MemoryLogFault};
pub use migration::InMemoryMigrationStore;
pub use stores::InMemoryStores;
