use thiserror::Error;

/// Core error type for SKIFF operations.
#[derive(Error, Debug)]
pub enum SkiffError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("No baseline migration found for namespace {namespace}")]
    BaselineMissing { namespace: String },

    #[error("Migration version {version} has already been applied to namespace {namespace} for engine {engine}")]
    AlreadyApplied {
        namespace: String,
        engine: String,
        version: String,
    },

    #[error("Migration version {version} is out of order for namespace {namespace}: version {min_recorded} is already recorded")]
    OutOfOrder {
        namespace: String,
        version: String,
        min_recorded: String,
    },

    #[error("Failed to set up internal schema: {0}")]
    SetupSchemaFailed(String),

    #[error("Migration execution failed for namespace {namespace}: {message} (statement: {statement})")]
    ExecutionFailed {
        namespace: String,
        statement: String,
        message: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),
}

impl From<serde_json::Error> for SkiffError {
    fn from(e: serde_json::Error) -> Self {
        SkiffError::Internal(format!("serialization error: {}", e))
    }
}

/// Result type alias using SkiffError.
pub type Result<T> = std::result::Result<T, SkiffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_failed_display_keeps_context() {
        let err = SkiffError::ExecutionFailed {
            namespace: "shop".to_string(),
            statement: "CREATE TABLE orders (id INTEGER)".to_string(),
            message: "table orders already exists".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("shop"));
        assert!(text.contains("CREATE TABLE orders"));
        assert!(text.contains("already exists"));
    }

    #[test]
    fn test_out_of_order_display() {
        let err = SkiffError::OutOfOrder {
            namespace: "shop".to_string(),
            version: "0.9".to_string(),
            min_recorded: "1.0".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("0.9"));
        assert!(text.contains("1.0"));
    }
}
