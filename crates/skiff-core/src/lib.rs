pub mod anomaly;
pub mod config;
pub mod error;
pub mod migration;

pub use anomaly::{
    AnomalyArchive, AnomalyFind, AnomalyRecord, AnomalySeverity, AnomalyType, AnomalyUpsert,
    RowStatus,
};
pub use config::StoreConfig;
pub use error::{Result, SkiffError};
pub use migration::{
    EngineKind, MigrationHistoryFind, MigrationInfo, MigrationRecord, MigrationStatus,
    MigrationType,
};
