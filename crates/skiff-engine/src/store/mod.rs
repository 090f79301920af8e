//! Metadata store access.
//!
//! The metadata store is the reserved internal database; services in this
//! module share one connection pool over it.

mod anomaly;

pub use anomaly::AnomalyService;

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, SqlitePool};

use skiff_core::config::StoreConfig;
use skiff_core::error::{Result, SkiffError};

/// Connection pool over the metadata store, bootstrapping the internal
/// schema on first contact.
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (creating if necessary) the metadata store described by `config`.
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.pool_timeout_secs));
        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| {
                SkiffError::Connection(format!(
                    "failed to open metadata store {:?}: {}",
                    config.path, e
                ))
            })?;

        // Idempotent: every statement in the internal schema is re-runnable.
        pool.execute(crate::INTERNAL_SCHEMA_SQL)
            .await
            .map_err(|e| {
                SkiffError::SetupSchemaFailed(format!("failed to apply internal schema: {}", e))
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check store connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| SkiffError::Database(format!("health check failed: {}", e)))?;
        Ok(())
    }

    /// Close all connections gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
