//! SQLite connector.
//!
//! An instance is a directory of `*.db` files; each file is one logical
//! database. The reserved internal database lives in the same directory and
//! is hidden from schema sync.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Connection, Executor, Row, TypeInfo, ValueRef};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use skiff_core::error::{Result, SkiffError};
use skiff_core::migration::{
    EngineKind, MigrationHistoryFind, MigrationInfo, MigrationRecord, MigrationStatus,
    MigrationType,
};

use super::{ConnectionConfig, ConnectionContext, DatabaseSchema, Driver, HistoryTxn};

/// Name of the reserved internal bookkeeping database.
pub const RESERVED_DATABASE: &str = "skiff";

const HISTORY_TABLE: &str = "skiff_migration_history";

const HISTORY_COLUMNS: &str = "id, creator, created_ts, updater, updated_ts, release_version, \
     namespace, sequence, engine, type, status, version, description, statement, \
     schema, schema_prev, execution_duration_ns, issue_id, payload";

/// SQLite driver. One handle wraps one connection to the currently selected
/// database; history transactions get their own short-lived connection to
/// the reserved database.
pub struct SqliteDriver {
    dir: PathBuf,
    conn: Option<SqliteConnection>,
    context: ConnectionContext,
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self {
            dir: PathBuf::new(),
            conn: None,
            context: ConnectionContext::default(),
        }
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| SkiffError::Connection("driver is not open".to_string()))
    }

    /// Close the current connection (if any) and connect to `database`.
    /// An empty name selects an in-memory database.
    async fn switch_database(&mut self, database: &str) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await.map_err(|e| {
                SkiffError::Connection(format!("failed to close previous connection: {}", e))
            })?;
        }
        let options = if database.is_empty() {
            SqliteConnectOptions::new().filename(":memory:")
        } else {
            SqliteConnectOptions::new()
                .filename(self.dir.join(format!("{}.db", database)))
                .create_if_missing(true)
        };
        let conn = SqliteConnection::connect_with(&options).await.map_err(|e| {
            SkiffError::Connection(format!("failed to open database {:?}: {}", database, e))
        })?;
        self.conn = Some(conn);
        Ok(())
    }

    /// Databases visible on the instance, sorted by name.
    async fn list_databases(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            SkiffError::Database(format!(
                "failed to read instance directory {:?}: {}",
                self.dir, e
            ))
        })?;
        let mut databases = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(database) = name.strip_suffix(".db") {
                databases.push(database.to_string());
            }
        }
        databases.sort();
        Ok(databases)
    }

    async fn open_metadata_conn(&self, create_if_missing: bool) -> Result<SqliteConnection> {
        let options = SqliteConnectOptions::new()
            .filename(self.dir.join(format!("{}.db", RESERVED_DATABASE)))
            .create_if_missing(create_if_missing)
            .busy_timeout(Duration::from_secs(30));
        SqliteConnection::connect_with(&options).await.map_err(|e| {
            SkiffError::Connection(format!("failed to open internal database: {}", e))
        })
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    async fn open(&mut self, config: ConnectionConfig, context: ConnectionContext) -> Result<()> {
        // Host is the directory (instance) containing all database files.
        self.dir = PathBuf::from(&config.host);
        self.switch_database(&config.database).await?;
        self.context = context;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .await
                .map_err(|e| SkiffError::Connection(format!("failed to close: {}", e)))?;
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.conn()?
            .ping()
            .await
            .map_err(|e| SkiffError::Connection(format!("ping failed: {}", e)))
    }

    async fn server_version(&mut self) -> Result<String> {
        let conn = self.conn()?;
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| SkiffError::Database(format!("failed to get version: {}", e)))?;
        Ok(version)
    }

    async fn sync_schema(&mut self) -> Result<Vec<DatabaseSchema>> {
        let databases = self.list_databases().await?;
        Ok(databases
            .into_iter()
            .filter(|name| name != RESERVED_DATABASE)
            .map(|name| DatabaseSchema { name })
            .collect())
    }

    async fn create_database(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(SkiffError::Internal(format!(
                "invalid database name {:?}",
                name
            )));
        }
        self.switch_database(name).await?;
        // Probe query so the database file is fully materialized.
        let conn = self.conn()?;
        sqlx::query("SELECT 1")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                SkiffError::Database(format!("failed to create database {:?}: {}", name, e))
            })?;
        debug!(database = name, "created database");
        Ok(())
    }

    async fn execute(&mut self, statement: &str, use_transaction: bool) -> Result<()> {
        let conn = self.conn()?;
        if use_transaction {
            let mut tx = conn
                .begin()
                .await
                .map_err(|e| SkiffError::Database(format!("failed to begin: {}", e)))?;
            (&mut *tx).execute(statement).await.map_err(|e| {
                SkiffError::Database(format!("failed to execute statement: {}", e))
            })?;
            tx.commit()
                .await
                .map_err(|e| SkiffError::Database(format!("failed to commit: {}", e)))?;
        } else {
            (&mut *conn).execute(statement).await.map_err(|e| {
                SkiffError::Database(format!("failed to execute statement: {}", e))
            })?;
        }
        Ok(())
    }

    async fn query(
        &mut self,
        statement: &str,
        row_limit: usize,
    ) -> Result<Vec<Vec<serde_json::Value>>> {
        let conn = self.conn()?;
        let mut rows = Vec::new();
        let mut stream = (&mut *conn).fetch(statement);
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| SkiffError::Database(format!("query failed: {}", e)))?
        {
            if rows.len() >= row_limit {
                break;
            }
            rows.push(decode_row(&row)?);
        }
        Ok(rows)
    }

    async fn dump(
        &mut self,
        database: &str,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        schema_only: bool,
    ) -> Result<()> {
        if database.is_empty() {
            return Err(SkiffError::Internal(
                "can only dump one database at a time".to_string(),
            ));
        }
        if !schema_only {
            return Err(SkiffError::Internal(
                "sqlite supports schema-only dumps".to_string(),
            ));
        }
        let databases = self.list_databases().await?;
        if !databases.iter().any(|name| name == database) {
            return Err(SkiffError::NotFound(format!(
                "database {} not found",
                database
            )));
        }

        // Scratch connection so the handle's current target stays untouched.
        let options = SqliteConnectOptions::new()
            .filename(self.dir.join(format!("{}.db", database)))
            .read_only(true);
        let mut conn = SqliteConnection::connect_with(&options).await.map_err(|e| {
            SkiffError::Connection(format!("failed to open database {:?}: {}", database, e))
        })?;

        let result = dump_schema_statements(&mut conn, out).await;
        let _ = conn.close().await;
        result
    }

    async fn restore(&mut self, input: &mut (dyn AsyncBufRead + Send + Unpin)) -> Result<()> {
        let conn = self.conn()?;
        let mut tx = conn
            .begin()
            .await
            .map_err(|e| SkiffError::Database(format!("failed to begin: {}", e)))?;

        let mut line = String::new();
        let mut statement = String::new();
        loop {
            line.clear();
            let n = input.read_line(&mut line).await?;
            if n == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("--") {
                continue;
            }
            statement.push_str(trimmed);
            statement.push('\n');
            if trimmed.ends_with(';') {
                apply_restore_statement(&mut tx, &statement).await?;
                statement.clear();
            }
        }
        if !statement.trim().is_empty() {
            apply_restore_statement(&mut tx, &statement).await?;
        }

        tx.commit()
            .await
            .map_err(|e| SkiffError::Database(format!("failed to commit restore: {}", e)))?;
        Ok(())
    }

    async fn needs_history_setup(&mut self) -> Result<bool> {
        let databases = self.list_databases().await?;
        if !databases.iter().any(|name| name == RESERVED_DATABASE) {
            return Ok(true);
        }
        let mut conn = self.open_metadata_conn(false).await?;
        let result = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(HISTORY_TABLE)
            .fetch_optional(&mut conn)
            .await
            .map_err(|e| SkiffError::Database(format!("failed to probe history table: {}", e)));
        let _ = conn.close().await;
        Ok(result?.is_none())
    }

    async fn setup_history_if_needed(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            SkiffError::SetupSchemaFailed(format!(
                "failed to create instance directory {:?}: {}",
                self.dir, e
            ))
        })?;
        if !self.needs_history_setup().await? {
            return Ok(());
        }

        info!(
            environment = %self.context.environment,
            instance = %self.context.instance,
            "internal schema not found, creating"
        );
        let mut conn = self
            .open_metadata_conn(true)
            .await
            .map_err(|e| SkiffError::SetupSchemaFailed(e.to_string()))?;
        if let Err(e) = (&mut conn).execute(crate::INTERNAL_SCHEMA_SQL).await {
            let _ = conn.close().await;
            return Err(SkiffError::SetupSchemaFailed(format!(
                "failed to apply internal schema: {}",
                e
            )));
        }
        let _ = conn.close().await;
        info!(
            environment = %self.context.environment,
            instance = %self.context.instance,
            "internal schema created"
        );
        Ok(())
    }

    async fn begin_history_txn(&mut self) -> Result<Box<dyn HistoryTxn>> {
        let mut conn = self.open_metadata_conn(false).await?;
        // IMMEDIATE takes the write lock up front, serializing concurrent
        // attempts before any validation read happens.
        if let Err(e) = (&mut conn).execute("BEGIN IMMEDIATE").await {
            let _ = conn.close().await;
            return Err(SkiffError::Database(format!(
                "failed to begin history transaction: {}",
                e
            )));
        }
        Ok(Box::new(SqliteHistoryTxn { conn }))
    }

    async fn find_migration_history(
        &mut self,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationRecord>> {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE 1 = 1",
            HISTORY_COLUMNS, HISTORY_TABLE
        );
        if find.id.is_some() {
            sql.push_str(" AND id = ?");
        }
        if find.namespace.is_some() {
            sql.push_str(" AND namespace = ?");
        }
        if find.version.is_some() {
            sql.push_str(" AND version = ?");
        }
        sql.push_str(" ORDER BY created_ts DESC, id DESC");
        if let Some(limit) = find.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut query = sqlx::query(&sql);
        if let Some(id) = find.id {
            query = query.bind(id);
        }
        if let Some(namespace) = &find.namespace {
            query = query.bind(namespace);
        }
        if let Some(version) = &find.version {
            query = query.bind(version);
        }

        let mut conn = self.open_metadata_conn(false).await?;
        let result = query
            .fetch_all(&mut conn)
            .await
            .map_err(|e| SkiffError::Database(format!("failed to query history: {}", e)));
        let _ = conn.close().await;
        result?.iter().map(record_from_row).collect()
    }
}

async fn dump_schema_statements(
    conn: &mut SqliteConnection,
    out: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<()> {
    let mut tx = conn
        .begin()
        .await
        .map_err(|e| SkiffError::Database(format!("failed to begin: {}", e)))?;

    {
        // Auto-generated objects (e.g. implicit indexes) carry a NULL sql.
        let mut stream = sqlx::query(
            "SELECT sql FROM sqlite_master WHERE sql IS NOT NULL ORDER BY rowid",
        )
        .fetch(&mut *tx);
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| SkiffError::Database(format!("failed to read schema: {}", e)))?
        {
            let statement: String = row.try_get(0)?;
            out.write_all(format!("{};\n", statement).as_bytes())
                .await?;
        }
    }

    tx.commit()
        .await
        .map_err(|e| SkiffError::Database(format!("failed to commit: {}", e)))?;
    Ok(())
}

async fn apply_restore_statement(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    statement: &str,
) -> Result<()> {
    (&mut **tx).execute(statement).await.map_err(|e| {
        SkiffError::Database(format!(
            "failed to restore statement {:?}: {}",
            statement.trim(),
            e
        ))
    })?;
    Ok(())
}

fn decode_row(row: &SqliteRow) -> Result<Vec<serde_json::Value>> {
    let mut values = Vec::with_capacity(row.len());
    for idx in 0..row.len() {
        values.push(decode_column(row, idx)?);
    }
    Ok(values)
}

fn decode_column(row: &SqliteRow, idx: usize) -> Result<serde_json::Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(serde_json::Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    match type_name.as_str() {
        "INTEGER" => Ok(serde_json::Value::from(row.try_get::<i64, _>(idx)?)),
        "REAL" => Ok(serde_json::Value::from(row.try_get::<f64, _>(idx)?)),
        "BOOLEAN" => Ok(serde_json::Value::from(row.try_get::<bool, _>(idx)?)),
        "BLOB" => Ok(serde_json::Value::from(hex::encode(
            row.try_get::<Vec<u8>, _>(idx)?,
        ))),
        _ => Ok(serde_json::Value::from(row.try_get::<String, _>(idx)?)),
    }
}

fn record_from_row(row: &SqliteRow) -> Result<MigrationRecord> {
    Ok(MigrationRecord {
        id: row.try_get("id")?,
        creator: row.try_get("creator")?,
        created_ts: row.try_get("created_ts")?,
        updater: row.try_get("updater")?,
        updated_ts: row.try_get("updated_ts")?,
        release_version: row.try_get("release_version")?,
        namespace: row.try_get("namespace")?,
        sequence: row.try_get("sequence")?,
        engine: EngineKind::parse(&row.try_get::<String, _>("engine")?)?,
        migration_type: MigrationType::parse(&row.try_get::<String, _>("type")?)?,
        status: MigrationStatus::parse(&row.try_get::<String, _>("status")?)?,
        version: row.try_get("version")?,
        description: row.try_get("description")?,
        statement: row.try_get("statement")?,
        schema: row.try_get("schema")?,
        schema_prev: row.try_get("schema_prev")?,
        execution_duration_ns: row.try_get("execution_duration_ns")?,
        issue_id: row.try_get("issue_id")?,
        payload: row.try_get("payload")?,
    })
}

/// History transaction owning its own connection to the reserved database.
/// Dropping it without commit lets SQLite abort the transaction when the
/// connection closes.
struct SqliteHistoryTxn {
    conn: SqliteConnection,
}

#[async_trait]
impl HistoryTxn for SqliteHistoryTxn {
    async fn has_baseline(&mut self, namespace: &str) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE namespace = ? AND type = 'BASELINE'",
            HISTORY_TABLE
        ))
        .bind(namespace)
        .fetch_optional(&mut self.conn)
        .await
        .map_err(|e| SkiffError::Database(format!("failed to look up baseline: {}", e)))?;
        Ok(row.is_some())
    }

    async fn next_sequence(&mut self, namespace: &str, require_baseline: bool) -> Result<i64> {
        let next: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(sequence) + 1 FROM {} WHERE namespace = ?",
            HISTORY_TABLE
        ))
        .bind(namespace)
        .fetch_one(&mut self.conn)
        .await
        .map_err(|e| SkiffError::Database(format!("failed to resolve next sequence: {}", e)))?;

        match next {
            Some(sequence) => Ok(sequence),
            // Empty namespace: first sequence is 1 unless a baseline was
            // supposed to exist already.
            None if !require_baseline => Ok(1),
            None => Err(SkiffError::BaselineMissing {
                namespace: namespace.to_string(),
            }),
        }
    }

    async fn has_version(
        &mut self,
        namespace: &str,
        engine: EngineKind,
        version: &str,
    ) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE namespace = ? AND engine = ? AND version = ?",
            HISTORY_TABLE
        ))
        .bind(namespace)
        .bind(engine.as_str())
        .bind(version)
        .fetch_optional(&mut self.conn)
        .await
        .map_err(|e| SkiffError::Database(format!("failed to check duplicate version: {}", e)))?;
        Ok(row.is_some())
    }

    async fn min_version_after(
        &mut self,
        namespace: &str,
        engine: EngineKind,
        version: &str,
    ) -> Result<Option<String>> {
        let min: Option<String> = sqlx::query_scalar(&format!(
            "SELECT MIN(version) FROM {} WHERE namespace = ? AND engine = ? AND version > ?",
            HISTORY_TABLE
        ))
        .bind(namespace)
        .bind(engine.as_str())
        .bind(version)
        .fetch_one(&mut self.conn)
        .await
        .map_err(|e| SkiffError::Database(format!("failed to check version order: {}", e)))?;
        Ok(min)
    }

    async fn insert_pending(
        &mut self,
        sequence: i64,
        prev_schema: &str,
        info: &MigrationInfo,
        statement: &str,
    ) -> Result<i64> {
        let now = Utc::now().timestamp();
        let id: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO {} (\
                creator, created_ts, updater, updated_ts, release_version, namespace, \
                sequence, engine, type, status, version, description, statement, \
                schema, schema_prev, execution_duration_ns, issue_id, payload\
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', ?, ?, ?, ?, ?, 0, ?, ?) \
            RETURNING id",
            HISTORY_TABLE
        ))
        .bind(&info.creator)
        .bind(now)
        .bind(&info.creator)
        .bind(now)
        .bind(&info.release_version)
        .bind(&info.namespace)
        .bind(sequence)
        .bind(info.engine.as_str())
        .bind(info.migration_type.as_str())
        .bind(&info.version)
        .bind(&info.description)
        .bind(statement)
        .bind(prev_schema)
        .bind(prev_schema)
        .bind(&info.issue_id)
        .bind(&info.payload)
        .fetch_one(&mut self.conn)
        .await
        .map_err(|e| SkiffError::Database(format!("failed to insert pending history: {}", e)))?;
        Ok(id)
    }

    async fn mark_done(&mut self, id: i64, duration_ns: i64, schema: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET status = 'DONE', execution_duration_ns = ?, schema = ?, \
             updated_ts = ? WHERE id = ?",
            HISTORY_TABLE
        ))
        .bind(duration_ns)
        .bind(schema)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&mut self.conn)
        .await
        .map_err(|e| SkiffError::Database(format!("failed to mark history done: {}", e)))?;
        Ok(())
    }

    async fn mark_failed(&mut self, id: i64, duration_ns: i64) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET status = 'FAILED', execution_duration_ns = ?, updated_ts = ? \
             WHERE id = ?",
            HISTORY_TABLE
        ))
        .bind(duration_ns)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&mut self.conn)
        .await
        .map_err(|e| SkiffError::Database(format!("failed to mark history failed: {}", e)))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut conn = self.conn;
        (&mut conn)
            .execute("COMMIT")
            .await
            .map_err(|e| SkiffError::Database(format!("failed to commit history: {}", e)))?;
        let _ = conn.close().await;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut conn = self.conn;
        (&mut conn)
            .execute("ROLLBACK")
            .await
            .map_err(|e| SkiffError::Database(format!("failed to roll back history: {}", e)))?;
        let _ = conn.close().await;
        Ok(())
    }
}
