//! Core types and traits
//!
//! This module provides the driver contract, the value and error types exchanged
//! with drivers, and the transactional executor built on top of them.

pub mod blocking;
pub mod config;
pub mod connection;
pub mod database_types;
pub mod error;
pub mod executor;
pub mod isolation;
pub mod parameter;
pub mod request;
pub mod transaction;
pub mod value;

// Re-export commonly used types
pub use blocking::{
    Blocking, BlockingCommand, BlockingConnection, BlockingCursor, BlockingTransaction,
    Interrupter,
};
pub use config::{ConnectionBuilder, ExecutorConfig};
pub use connection::{ConnectionState, DbCommand, DbConnection, DbTransaction, RowCursor};
pub use database_types::DatabaseType;
pub use error::{DatabaseError, Result};
pub use executor::{
    ensure_open, execute, execute_reader, execute_scalar, execute_scalar_value,
    run_with_transaction, CommandFuture, CommandPhase, ConnectionExt, LeaveOpen,
};
pub use isolation::IsolationLevel;
pub use parameter::{Parameter, ParameterType};
pub use request::CommandRequest;
pub use transaction::TransactionScope;
pub use value::{DatabaseResult, DatabaseRow, DatabaseValue, FromDatabaseValue};
