//! Error types for the command executor
//!
//! This module defines all error types that can occur while opening connections,
//! running commands inside transactions, and shaping their results.

/// Result type alias for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Error types for database operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// A required argument was absent or malformed; raised before any I/O
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The command body, parameter binding, or commit failed and the transaction
    /// was rolled back. The underlying failure is kept as the source.
    #[error("Command execution failed")]
    CommandFailed {
        #[source]
        source: Box<DatabaseError>,
    },

    /// The caller's cancellation signal fired before the operation could start
    #[error("Operation cancelled")]
    Cancelled,

    /// Connection error (generic)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Connection timeout
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    /// A driver primitive did not finish within the configured timeout
    #[error("Operation timeout after {timeout_ms}ms")]
    OperationTimeout { timeout_ms: u64 },

    /// Query execution error
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Type conversion error
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Column not found
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Transaction error
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// SQLite error
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// PostgreSQL error
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    PostgresError(#[from] tokio_postgres::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl DatabaseError {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        DatabaseError::InvalidArgument(msg.into())
    }

    /// Wrap a failure raised inside a transaction scope
    pub fn command_failed(source: DatabaseError) -> Self {
        DatabaseError::CommandFailed {
            source: Box::new(source),
        }
    }

    /// Create a new connection error (generic)
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        DatabaseError::ConnectionError(msg.into())
    }

    /// Create a connection timeout error
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        DatabaseError::ConnectionTimeout { timeout_ms }
    }

    /// Create an operation timeout error
    pub fn operation_timeout(timeout_ms: u64) -> Self {
        DatabaseError::OperationTimeout { timeout_ms }
    }

    /// Create a new query error
    pub fn query<S: Into<String>>(msg: S) -> Self {
        DatabaseError::QueryError(msg.into())
    }

    /// Create a new type mismatch error
    pub fn type_mismatch(expected: &str, actual: &str) -> Self {
        DatabaseError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create a new transaction error
    pub fn transaction<S: Into<String>>(msg: S) -> Self {
        DatabaseError::TransactionError(msg.into())
    }

    /// Create a generic error
    pub fn other<S: Into<String>>(msg: S) -> Self {
        DatabaseError::Other(msg.into())
    }

    /// The error that caused a [`DatabaseError::CommandFailed`], if this is one
    pub fn cause(&self) -> Option<&DatabaseError> {
        match self {
            DatabaseError::CommandFailed { source } => Some(source),
            _ => None,
        }
    }
}
