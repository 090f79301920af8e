use serde::{Deserialize, Serialize};

use crate::error::{Result, SkiffError};

/// Relational engine kinds a driver may target.
///
/// The serialized form must stay byte-identical to [`EngineKind::as_str`];
/// both feed the same `engine` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    #[serde(rename = "MYSQL")]
    MySql,
    #[serde(rename = "POSTGRES")]
    Postgres,
    #[serde(rename = "TIDB")]
    TiDb,
    #[serde(rename = "SNOWFLAKE")]
    Snowflake,
    #[serde(rename = "CLICKHOUSE")]
    ClickHouse,
    #[serde(rename = "SQLITE")]
    Sqlite,
}

impl EngineKind {
    /// Convert to database string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MySql => "MYSQL",
            Self::Postgres => "POSTGRES",
            Self::TiDb => "TIDB",
            Self::Snowflake => "SNOWFLAKE",
            Self::ClickHouse => "CLICKHOUSE",
            Self::Sqlite => "SQLITE",
        }
    }

    /// Parse from database string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "MYSQL" => Ok(Self::MySql),
            "POSTGRES" => Ok(Self::Postgres),
            "TIDB" => Ok(Self::TiDb),
            "SNOWFLAKE" => Ok(Self::Snowflake),
            "CLICKHOUSE" => Ok(Self::ClickHouse),
            "SQLITE" => Ok(Self::Sqlite),
            other => Err(SkiffError::Database(format!(
                "unknown engine kind {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationType {
    /// Seeds history without representing an actual schema change.
    Baseline,
    /// A regular schema migration.
    Migrate,
    /// Forks history for a new branch of the schema.
    Branch,
    /// A data-only change (DML).
    Data,
}

impl MigrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Baseline => "BASELINE",
            Self::Migrate => "MIGRATE",
            Self::Branch => "BRANCH",
            Self::Data => "DATA",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "BASELINE" => Ok(Self::Baseline),
            "MIGRATE" => Ok(Self::Migrate),
            "BRANCH" => Ok(Self::Branch),
            "DATA" => Ok(Self::Data),
            other => Err(SkiffError::Database(format!(
                "unknown migration type {:?}",
                other
            ))),
        }
    }

    /// Baseline and branch rows intentionally reset or fork history, so they
    /// are exempt from the out-of-order version check.
    pub fn exempt_from_ordering(&self) -> bool {
        matches!(self, Self::Baseline | Self::Branch)
    }
}

impl std::fmt::Display for MigrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a history row.
///
/// Pending is transient: it must become Done or Failed within the same
/// executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Pending,
    Done,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            other => Err(SkiffError::Database(format!(
                "unknown migration status {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor for one migration attempt, supplied by the caller.
#[derive(Debug, Clone)]
pub struct MigrationInfo {
    /// Logical identifier of the target database within the instance.
    pub namespace: String,
    /// Engine the target runs on.
    pub engine: EngineKind,
    /// Classification of this attempt.
    pub migration_type: MigrationType,
    /// Caller-supplied semantic version, unique per (namespace, engine).
    pub version: String,
    /// Version of the release that shipped this migration.
    pub release_version: String,
    /// Human-readable description.
    pub description: String,
    /// Identity of whoever initiated the attempt.
    pub creator: String,
    /// Link to the originating change request.
    pub issue_id: String,
    /// Opaque structured metadata, stored as JSON text.
    pub payload: String,
    /// Whether the namespace policy requires a baseline row before any
    /// non-baseline migration is accepted.
    pub require_baseline: bool,
}

impl MigrationInfo {
    /// Create a descriptor with the common fields; the rest default to empty.
    pub fn new(
        namespace: impl Into<String>,
        engine: EngineKind,
        migration_type: MigrationType,
        version: impl Into<String>,
        creator: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            engine,
            migration_type,
            version: version.into(),
            release_version: String::new(),
            description: String::new(),
            creator: creator.into(),
            issue_id: String::new(),
            payload: String::new(),
            require_baseline: false,
        }
    }
}

/// One row of the migration history ledger.
///
/// Column names and types are a durable contract consumed by external audit
/// tooling; do not rename fields without migrating the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: i64,
    pub creator: String,
    pub created_ts: i64,
    pub updater: String,
    pub updated_ts: i64,
    pub release_version: String,
    pub namespace: String,
    pub sequence: i64,
    pub engine: EngineKind,
    pub migration_type: MigrationType,
    pub status: MigrationStatus,
    pub version: String,
    pub description: String,
    pub statement: String,
    /// Full schema snapshot captured immediately after execution.
    pub schema: String,
    /// Full schema snapshot captured immediately before execution.
    pub schema_prev: String,
    pub execution_duration_ns: i64,
    pub issue_id: String,
    pub payload: String,
}

/// Filter for querying the migration history ledger.
#[derive(Debug, Clone, Default)]
pub struct MigrationHistoryFind {
    pub id: Option<i64>,
    pub namespace: Option<String>,
    pub version: Option<String>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_round_trip() {
        for kind in [
            EngineKind::MySql,
            EngineKind::Postgres,
            EngineKind::TiDb,
            EngineKind::Snowflake,
            EngineKind::ClickHouse,
            EngineKind::Sqlite,
        ] {
            assert_eq!(EngineKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(EngineKind::parse("ORACLE").is_err());
    }

    #[test]
    fn test_engine_kind_serde_matches_ledger_form() {
        for kind in [
            EngineKind::MySql,
            EngineKind::Postgres,
            EngineKind::TiDb,
            EngineKind::Snowflake,
            EngineKind::ClickHouse,
            EngineKind::Sqlite,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("{:?}", kind.as_str()));
            assert_eq!(serde_json::from_str::<EngineKind>(&json).unwrap(), kind);
            assert_eq!(EngineKind::parse(json.trim_matches('"')).unwrap(), kind);
        }
    }

    #[test]
    fn test_migration_type_round_trip() {
        for t in [
            MigrationType::Baseline,
            MigrationType::Migrate,
            MigrationType::Branch,
            MigrationType::Data,
        ] {
            assert_eq!(MigrationType::parse(t.as_str()).unwrap(), t);
        }
    }

    #[test]
    fn test_ordering_exemption() {
        assert!(MigrationType::Baseline.exempt_from_ordering());
        assert!(MigrationType::Branch.exempt_from_ordering());
        assert!(!MigrationType::Migrate.exempt_from_ordering());
        assert!(!MigrationType::Data.exempt_from_ordering());
    }

    #[test]
    fn test_status_parse_rejects_unknown() {
        assert!(MigrationStatus::parse("RUNNING").is_err());
        assert_eq!(
            MigrationStatus::parse("PENDING").unwrap(),
            MigrationStatus::Pending
        );
    }

    #[test]
    fn test_migration_info_new_defaults() {
        let info = MigrationInfo::new(
            "shop",
            EngineKind::Sqlite,
            MigrationType::Migrate,
            "1.0",
            "alice",
        );
        assert_eq!(info.namespace, "shop");
        assert!(!info.require_baseline);
        assert!(info.issue_id.is_empty());
    }
}
