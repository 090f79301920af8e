pub mod driver;
pub mod executor;
pub mod store;

/// Internal schema applied to the reserved bookkeeping database, embedded
/// from the migrations directory.
pub(crate) const INTERNAL_SCHEMA_SQL: &str =
    include_str!("../migrations/0000_skiff_internal.sql");

pub use driver::{
    parse_create_database, ConnectionConfig, ConnectionContext, DatabaseSchema, Driver,
    DriverFactory, DriverRegistry, HistoryTxn, SqliteDriver,
};
pub use executor::{MigrationExecutor, MigrationOutcome};
pub use store::{AnomalyService, MetadataStore};
