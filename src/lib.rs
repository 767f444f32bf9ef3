//! # Rust Database Executor
//!
//! Transactional command execution over a generic async database connection.
//!
//! Every call runs one command inside its own transaction: the connection is opened
//! if needed, a transaction is begun at the requested isolation level, the command is
//! executed, and the transaction is committed. Any failure inside the transaction rolls
//! it back and is reported as [`DatabaseError::CommandFailed`] with the original error
//! as its source. The connection is closed before the call returns.
//!
//! ## Features
//!
//! - **Three result shapes**: affected-row count, a single coerced scalar, or every
//!   row as an ordered column-name to value mapping
//! - **Driver contract**: async traits for native async drivers, blocking traits plus
//!   an adapter that runs synchronous drivers on tokio's blocking pool
//! - **Cancellation**: a `CancellationToken` on the request stops opening and
//!   transaction begin
//! - **Tracing**: every call logs its phases under the `executor::*` targets
//!
//! ## Supported Databases
//!
//! | Database | Feature | Driver |
//! |----------|---------|--------|
//! | SQLite | `sqlite` (default) | rusqlite, bundled, via [`Blocking`] |
//! | PostgreSQL | `postgres` | tokio-postgres, native async |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_database_executor::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut connection = Blocking::new(SqliteConnection::new("app.db"));
//!
//!     connection
//!         .leave_open()
//!         .execute(CommandRequest::new(
//!             "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT)",
//!         ))
//!         .await?;
//!
//!     connection
//!         .leave_open()
//!         .execute(CommandRequest::new("INSERT INTO users (name) VALUES (:name)").param("name", "Alice"))
//!         .await?;
//!
//!     let rows = connection
//!         .execute_reader(CommandRequest::new("SELECT id, name FROM users"))
//!         .await?;
//!     for row in rows {
//!         println!("{}: {}", row.get_as::<i64>("id")?, row.get_as::<String>("name")?);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Scalars and isolation levels
//!
//! ```rust,no_run
//! use rust_database_executor::prelude::*;
//! use chrono::{DateTime, Utc};
//!
//! # async fn run() -> Result<()> {
//! let now: DateTime<Utc> = Blocking::new(SqliteConnection::new(":memory:"))
//!     .execute_scalar(
//!         CommandRequest::new("SELECT CURRENT_TIMESTAMP")
//!             .isolation_level(IsolationLevel::Serializable),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

/// Core types, driver contract and executor
pub mod core;

/// Database driver implementations
pub mod backends;

/// Prelude for convenient imports
///
/// ```rust
/// use rust_database_executor::prelude::*;
///
/// let request = CommandRequest::new("SELECT 1").isolation_level(IsolationLevel::Snapshot);
/// assert_eq!(request.level(), IsolationLevel::Snapshot);
/// ```
pub mod prelude {
    pub use crate::core::{
        run_with_transaction, Blocking, CommandRequest, ConnectionBuilder, ConnectionExt,
        ConnectionState, DatabaseError, DatabaseResult, DatabaseRow, DatabaseType,
        DatabaseValue, DbCommand, DbConnection, ExecutorConfig, FromDatabaseValue,
        IsolationLevel, Parameter, ParameterType, Result,
    };

    #[cfg(feature = "sqlite")]
    pub use crate::backends::SqliteConnection;

    #[cfg(feature = "postgres")]
    pub use crate::backends::PostgresConnection;
}

// Re-export at root level for convenience
pub use core::{
    Blocking, CommandRequest, ConnectionExt, DatabaseError, DatabaseResult, DatabaseRow,
    DatabaseType, DatabaseValue, DbConnection, IsolationLevel, Result,
};

#[cfg(feature = "sqlite")]
pub use backends::SqliteConnection;
