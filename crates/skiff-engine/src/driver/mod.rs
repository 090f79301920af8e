//! Engine connector contract.
//!
//! Every engine-specific connector implements [`Driver`]; the executor and
//! any external tooling talk to targets exclusively through it. Drivers are
//! opened through an explicit [`DriverRegistry`] built at process start, so
//! there is no global registration side channel.

mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncWrite};

use skiff_core::error::{Result, SkiffError};
use skiff_core::migration::{EngineKind, MigrationHistoryFind, MigrationInfo, MigrationRecord};

pub use sqlite::SqliteDriver;

/// How to reach a target instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Host of the instance. For the SQLite connector this is the directory
    /// containing the instance's database files.
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Database to connect to. Empty selects an engine-defined default
    /// (in-memory for the SQLite connector).
    #[serde(default)]
    pub database: String,
}

/// Descriptive context attached to a connection, used for log correlation.
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    pub environment: String,
    pub instance: String,
}

/// Minimal structural description of one database visible on an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSchema {
    pub name: String,
}

/// Capability contract every engine connector satisfies.
///
/// A driver handle wraps one physical connection and takes `&mut self`
/// throughout; callers needing concurrency against the same target open
/// independent handles. A handle whose in-flight operation was cancelled is
/// in unknown state and must be discarded, not reused.
#[async_trait]
pub trait Driver: Send {
    /// Connect to a target. Reconnecting on an already-open handle first
    /// closes the existing connection.
    async fn open(&mut self, config: ConnectionConfig, context: ConnectionContext) -> Result<()>;

    /// Release resources. Safe to call multiple times.
    async fn close(&mut self) -> Result<()>;

    /// Liveness check.
    async fn ping(&mut self) -> Result<()>;

    /// Engine server version string.
    async fn server_version(&mut self) -> Result<String>;

    /// Enumerate databases visible on the instance, excluding the reserved
    /// internal bookkeeping database.
    async fn sync_schema(&mut self) -> Result<Vec<DatabaseSchema>>;

    /// Create (or open) a logical database on the instance and switch the
    /// handle to it. This is a structural command rather than a SQL
    /// statement because several engines cannot express create-and-switch
    /// over one ordinary connection.
    async fn create_database(&mut self, name: &str) -> Result<()>;

    /// Apply a statement. With `use_transaction` the whole statement runs in
    /// one transaction, committed only on success and rolled back on any
    /// error.
    async fn execute(&mut self, statement: &str, use_transaction: bool) -> Result<()>;

    /// Run a query, returning rows as generic JSON tuples. At most
    /// `row_limit` rows are returned; excess rows are truncated, not an
    /// error.
    async fn query(
        &mut self,
        statement: &str,
        row_limit: usize,
    ) -> Result<Vec<Vec<serde_json::Value>>>;

    /// Stream a textual reconstruction of one database to `out` as
    /// newline-terminated, semicolon-delimited SQL statements. Fails
    /// `NotFound` if the database does not exist.
    async fn dump(
        &mut self,
        database: &str,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        schema_only: bool,
    ) -> Result<()>;

    /// Apply a multi-statement script read incrementally from `input`, all
    /// inside one transaction; any statement failure rolls back everything
    /// applied so far. The script is never materialized fully in memory.
    async fn restore(&mut self, input: &mut (dyn AsyncBufRead + Send + Unpin)) -> Result<()>;

    /// Whether the reserved internal database and its history table are
    /// absent from this instance.
    async fn needs_history_setup(&mut self) -> Result<bool>;

    /// Create the internal bookkeeping schema if it is absent. Idempotent;
    /// a failure leaves the instance exactly as it was.
    async fn setup_history_if_needed(&mut self) -> Result<()>;

    /// Begin a transaction on the history ledger. The returned handle owns
    /// its own connection to the metadata partition, so the driver handle
    /// stays free for target-side work.
    async fn begin_history_txn(&mut self) -> Result<Box<dyn HistoryTxn>>;

    /// Query the history ledger, newest rows first.
    async fn find_migration_history(
        &mut self,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationRecord>>;
}

/// One transaction over the migration history ledger.
///
/// Sequence resolution, the duplicate/out-of-order checks, and the pending
/// insert must all happen within a single transaction so concurrent attempts
/// on the same namespace cannot race on sequence assignment.
#[async_trait]
pub trait HistoryTxn: Send {
    /// Whether the namespace has at least one BASELINE row.
    async fn has_baseline(&mut self, namespace: &str) -> Result<bool>;

    /// Highest recorded sequence plus one; 1 for an empty namespace when
    /// baselining is not required, `BaselineMissing` otherwise.
    async fn next_sequence(&mut self, namespace: &str, require_baseline: bool) -> Result<i64>;

    /// Whether (namespace, engine, version) is already recorded.
    async fn has_version(
        &mut self,
        namespace: &str,
        engine: EngineKind,
        version: &str,
    ) -> Result<bool>;

    /// Smallest recorded version strictly greater than `version`, if any.
    async fn min_version_after(
        &mut self,
        namespace: &str,
        engine: EngineKind,
        version: &str,
    ) -> Result<Option<String>>;

    /// Insert a PENDING row and return its id.
    async fn insert_pending(
        &mut self,
        sequence: i64,
        prev_schema: &str,
        info: &MigrationInfo,
        statement: &str,
    ) -> Result<i64>;

    /// Resolve a PENDING row to DONE with the post-migration snapshot.
    async fn mark_done(&mut self, id: i64, duration_ns: i64, schema: &str) -> Result<()>;

    /// Resolve a PENDING row to FAILED. Also the terminal state when the
    /// post-execution snapshot cannot be captured: the statement may have
    /// committed, but a row without its post-migration schema must not
    /// read as DONE.
    async fn mark_failed(&mut self, id: i64, duration_ns: i64) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Constructor for a closed driver handle.
pub type DriverFactory = fn() -> Box<dyn Driver>;

/// Explicit factory map from engine kind to driver constructor, built once
/// at process start and passed by reference wherever drivers are opened.
#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<EngineKind, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry seeded with the bundled connectors.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(EngineKind::Sqlite, || Box::new(SqliteDriver::new()));
        registry
    }

    /// Register a connector for an engine kind, replacing any previous one.
    pub fn register(&mut self, engine: EngineKind, factory: DriverFactory) {
        self.factories.insert(engine, factory);
    }

    /// Construct and open a driver for the given engine.
    pub async fn open(
        &self,
        engine: EngineKind,
        config: ConnectionConfig,
        context: ConnectionContext,
    ) -> Result<Box<dyn Driver>> {
        let factory = self.factories.get(&engine).ok_or_else(|| {
            SkiffError::Config(format!("no driver registered for engine {}", engine))
        })?;
        let mut driver = factory();
        driver.open(config, context).await?;
        Ok(driver)
    }
}

/// Recognize the legacy `CREATE DATABASE '<name>'` pseudo-statement.
///
/// Callers that still issue the pseudo-statement text get routed to
/// [`Driver::create_database`] instead of the engine's SQL layer. Returns
/// `Ok(None)` for ordinary statements and an error for a malformed
/// pseudo-statement.
pub fn parse_create_database(statement: &str) -> Result<Option<&str>> {
    let statement = statement.trim().trim_end_matches(';');
    if !statement.starts_with("CREATE DATABASE ") {
        return Ok(None);
    }
    let parts: Vec<&str> = statement.split('\'').collect();
    if parts.len() != 3 || parts[1].is_empty() {
        return Err(SkiffError::Internal(format!(
            "invalid create database statement {:?}",
            statement
        )));
    }
    Ok(Some(parts[1]))
}
