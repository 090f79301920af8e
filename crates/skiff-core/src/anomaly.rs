use serde::{Deserialize, Serialize};

use crate::error::{Result, SkiffError};

/// Detectable out-of-band problem conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyType {
    /// The instance is unreachable.
    InstanceConnection,
    /// The internal history schema on the instance is missing or damaged.
    InstanceMigrationSchema,
    /// A database within the instance is unreachable.
    DatabaseConnection,
    /// The observed schema no longer matches the recorded snapshot.
    DatabaseSchemaDrift,
    /// A backup required by policy has not been taken.
    DatabaseBackupMissing,
    /// The backup configuration violates policy.
    DatabaseBackupPolicyViolation,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceConnection => "INSTANCE_CONNECTION",
            Self::InstanceMigrationSchema => "INSTANCE_MIGRATION_SCHEMA",
            Self::DatabaseConnection => "DATABASE_CONNECTION",
            Self::DatabaseSchemaDrift => "DATABASE_SCHEMA_DRIFT",
            Self::DatabaseBackupMissing => "DATABASE_BACKUP_MISSING",
            Self::DatabaseBackupPolicyViolation => "DATABASE_BACKUP_POLICY_VIOLATION",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "INSTANCE_CONNECTION" => Ok(Self::InstanceConnection),
            "INSTANCE_MIGRATION_SCHEMA" => Ok(Self::InstanceMigrationSchema),
            "DATABASE_CONNECTION" => Ok(Self::DatabaseConnection),
            "DATABASE_SCHEMA_DRIFT" => Ok(Self::DatabaseSchemaDrift),
            "DATABASE_BACKUP_MISSING" => Ok(Self::DatabaseBackupMissing),
            "DATABASE_BACKUP_POLICY_VIOLATION" => Ok(Self::DatabaseBackupPolicyViolation),
            other => Err(SkiffError::Database(format!(
                "unknown anomaly type {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an anomaly, derived deterministically from its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalySeverity {
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    /// Pure mapping from anomaly type to severity.
    pub fn from_type(anomaly_type: AnomalyType) -> Self {
        match anomaly_type {
            AnomalyType::InstanceConnection | AnomalyType::DatabaseConnection => Self::Critical,
            AnomalyType::DatabaseSchemaDrift | AnomalyType::DatabaseBackupMissing => Self::High,
            AnomalyType::InstanceMigrationSchema
            | AnomalyType::DatabaseBackupPolicyViolation => Self::Medium,
        }
    }
}

/// Row lifecycle status. Anomalies are never deleted; resolution archives
/// them in place, preserving history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowStatus {
    Normal,
    Archived,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "NORMAL" => Ok(Self::Normal),
            "ARCHIVED" => Ok(Self::Archived),
            other => Err(SkiffError::Database(format!(
                "unknown row status {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected problem condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: i64,
    pub row_status: RowStatus,
    pub creator: String,
    pub created_ts: i64,
    pub updater: String,
    pub updated_ts: i64,
    /// Instance the anomaly was observed on.
    pub instance: String,
    /// Database within the instance; None means instance-scoped.
    pub database: Option<String>,
    pub anomaly_type: AnomalyType,
    pub payload: String,
    /// Derived from `anomaly_type`, exposed on every returned record.
    pub severity: AnomalySeverity,
}

/// Parameters for upserting an active anomaly.
#[derive(Debug, Clone)]
pub struct AnomalyUpsert {
    pub creator: String,
    pub instance: String,
    pub database: Option<String>,
    pub anomaly_type: AnomalyType,
    pub payload: String,
}

/// Filter for listing anomalies.
#[derive(Debug, Clone, Default)]
pub struct AnomalyFind {
    pub row_status: Option<RowStatus>,
    pub instance: Option<String>,
    pub database: Option<String>,
    pub anomaly_type: Option<AnomalyType>,
    /// Restrict to instance-scoped rows (database is NULL). Only meaningful
    /// together with `instance`.
    pub instance_only: bool,
}

/// Parameters for archiving active anomalies. Exactly one of `instance` or
/// `database` must be set.
#[derive(Debug, Clone)]
pub struct AnomalyArchive {
    pub updater: String,
    pub instance: Option<String>,
    pub database: Option<String>,
    pub anomaly_type: AnomalyType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            AnomalySeverity::from_type(AnomalyType::InstanceConnection),
            AnomalySeverity::Critical
        );
        assert_eq!(
            AnomalySeverity::from_type(AnomalyType::DatabaseConnection),
            AnomalySeverity::Critical
        );
        assert_eq!(
            AnomalySeverity::from_type(AnomalyType::DatabaseSchemaDrift),
            AnomalySeverity::High
        );
        assert_eq!(
            AnomalySeverity::from_type(AnomalyType::DatabaseBackupMissing),
            AnomalySeverity::High
        );
        assert_eq!(
            AnomalySeverity::from_type(AnomalyType::InstanceMigrationSchema),
            AnomalySeverity::Medium
        );
        assert_eq!(
            AnomalySeverity::from_type(AnomalyType::DatabaseBackupPolicyViolation),
            AnomalySeverity::Medium
        );
    }

    #[test]
    fn test_anomaly_type_round_trip() {
        for t in [
            AnomalyType::InstanceConnection,
            AnomalyType::InstanceMigrationSchema,
            AnomalyType::DatabaseConnection,
            AnomalyType::DatabaseSchemaDrift,
            AnomalyType::DatabaseBackupMissing,
            AnomalyType::DatabaseBackupPolicyViolation,
        ] {
            assert_eq!(AnomalyType::parse(t.as_str()).unwrap(), t);
        }
        assert!(AnomalyType::parse("DISK_FULL").is_err());
    }

    #[test]
    fn test_row_status_round_trip() {
        assert_eq!(RowStatus::parse("NORMAL").unwrap(), RowStatus::Normal);
        assert_eq!(RowStatus::parse("ARCHIVED").unwrap(), RowStatus::Archived);
        assert!(RowStatus::parse("DELETED").is_err());
    }
}
