use thiserror::Error;
use tokio_postgres::error::SqlState;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Table {0} already exists")]
    TableExists(String),

    #[error("Table {0} does not exist")]
    TableNotFound(String),

    #[error("Column \"{column}\" already exists in table \"{table}\"")]
    ColumnExists { table: String, column: String },

    #[error("Column \"{column}\" does not exist in table \"{table}\"")]
    ColumnNotFound { table: String, column: String },

    #[error("Table name \"{0}\" is unchanged")]
    SameName(String),

    #[error("Invalid value for {column}: {reason}")]
    InvalidValue { column: String, reason: String },

    #[error("Possible SQL injection in {column}: value contains {signature}")]
    SqlInjectionSuspected { column: String, signature: String },

    #[error("Type mismatch for column {column}: {reason}")]
    TypeMismatch { column: String, reason: String },

    #[error("No matching record found in table {0}")]
    NoMatchingRecord(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Query contains forbidden operations: {0}")]
    ForbiddenQuery(String),

    #[error("Syntax error: {0}")]
    SyntaxError(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Pool exhausted")]
    PoolExhausted,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn invalid_value(column: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidValue {
            column: column.into(),
            reason: reason.into(),
        }
    }

    pub fn type_mismatch(column: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::TypeMismatch {
            column: column.into(),
            reason: reason.into(),
        }
    }

    pub fn column_not_found(table: impl Into<String>, column: impl Into<String>) -> Self {
        CoreError::ColumnNotFound {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn column_exists(table: impl Into<String>, column: impl Into<String>) -> Self {
        CoreError::ColumnExists {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Stable machine-readable code, used in structured logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidIdentifier(_) => "invalid_identifier",
            CoreError::TableExists(_) => "table_exists",
            CoreError::TableNotFound(_) => "table_not_found",
            CoreError::ColumnExists { .. } => "column_exists",
            CoreError::ColumnNotFound { .. } => "column_not_found",
            CoreError::SameName(_) => "same_name",
            CoreError::InvalidValue { .. } => "invalid_value",
            CoreError::SqlInjectionSuspected { .. } => "sql_injection_suspected",
            CoreError::TypeMismatch { .. } => "type_mismatch",
            CoreError::NoMatchingRecord(_) => "no_matching_record",
            CoreError::UnsupportedOperation(_) => "unsupported_operation",
            CoreError::ForbiddenQuery(_) => "forbidden_query",
            CoreError::SyntaxError(_) => "syntax_error",
            CoreError::InvalidPayload(_) => "invalid_payload",
            CoreError::ConstraintViolation(_) => "constraint_violation",
            CoreError::PoolExhausted => "pool_exhausted",
            CoreError::Timeout(_) => "timeout",
            CoreError::Database(_) => "database",
            CoreError::Serialization(_) => "serialization",
        }
    }

    /// Errors raised while decoding the request shape, before any statement runs.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidPayload(_) | CoreError::UnsupportedOperation(_)
        )
    }
}

impl From<tokio_postgres::Error> for CoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        let message = e
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| e.to_string());

        match e.code() {
            Some(code)
                if *code == SqlState::UNIQUE_VIOLATION
                    || *code == SqlState::FOREIGN_KEY_VIOLATION =>
            {
                CoreError::ConstraintViolation(message)
            }
            Some(code)
                if *code == SqlState::SYNTAX_ERROR
                    || *code == SqlState::UNDEFINED_TABLE
                    || *code == SqlState::UNDEFINED_COLUMN
                    || *code == SqlState::UNDEFINED_FUNCTION =>
            {
                CoreError::SyntaxError(message)
            }
            _ => CoreError::Database(message),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}
