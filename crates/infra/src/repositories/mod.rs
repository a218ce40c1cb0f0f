mod counter;
mod cursor;
mod migration;
mod postgres;

pub use counter::PostgresCounterStore;
pub use cursor::PostgresCursorStore;
pub use migration::PostgresMigrationStore;
pub use postgres::PostgresStores;
