//! Driver contract consumed by the command executor
//!
//! These traits describe the primitives the executor sequences: open/close, begin a
//! transaction, create a command, execute it in one of three modes, and walk a row
//! cursor. Drivers with native async I/O implement them directly; drivers that only
//! offer blocking calls implement the traits in [`super::blocking`] and are lifted by
//! [`super::blocking::Blocking`].

use super::database_types::DatabaseType;
use super::error::Result;
use super::isolation::IsolationLevel;
use super::parameter::Parameter;
use super::value::DatabaseValue;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Connection lifecycle state as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected
    Closed,
    /// Ready for commands
    Open,
    /// Connected once but no longer usable; must be closed and reopened
    Broken,
}

/// A database connection
#[async_trait]
pub trait DbConnection: Send {
    /// The kind of database behind this connection
    fn database_type(&self) -> DatabaseType;

    /// Current lifecycle state
    fn state(&self) -> ConnectionState;

    /// Open the connection
    ///
    /// Implementations should stop waiting and return
    /// [`DatabaseError::Cancelled`](super::error::DatabaseError::Cancelled) once `cancel` fires.
    async fn open(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Close the connection. Closing a closed connection is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// Begin a transaction at the given isolation level
    async fn begin_transaction(
        &mut self,
        level: IsolationLevel,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn DbTransaction>>;

    /// Create a command bound to this connection (and its active transaction)
    fn create_command(&mut self) -> Result<Box<dyn DbCommand>>;
}

/// A command prepared against a connection
#[async_trait]
pub trait DbCommand: Send {
    /// The command text
    fn command_text(&self) -> &str;

    /// Replace the command text
    fn set_command_text(&mut self, text: &str);

    /// Append a parameter; parameters bind in the order they were added
    fn add_parameter(&mut self, parameter: Parameter) -> Result<()>;

    /// Parameters added so far
    fn parameters(&self) -> &[Parameter];

    /// Execute without reading rows and return the number of affected rows
    async fn execute_non_query(&mut self) -> Result<u64>;

    /// Execute and return the first column of the first row, or
    /// [`DatabaseValue::Null`] when there is none
    async fn execute_scalar(&mut self) -> Result<DatabaseValue>;

    /// Execute and return a forward-only cursor over the result rows
    async fn execute_reader(&mut self) -> Result<Box<dyn RowCursor>>;
}

/// An active transaction
///
/// A failed commit leaves the transaction pending so that it can still be rolled back.
#[async_trait]
pub trait DbTransaction: Send {
    /// The isolation level the transaction was started with
    fn isolation_level(&self) -> IsolationLevel;

    /// Commit the transaction
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the transaction
    async fn rollback(&mut self) -> Result<()>;
}

/// Forward-only cursor over the rows of a result set
#[async_trait]
pub trait RowCursor: Send {
    /// Advance to the next row; `false` once the rows are exhausted
    async fn read(&mut self) -> Result<bool>;

    /// Number of columns in the result set
    fn field_count(&self) -> usize;

    /// Name of the column at `index`
    fn name(&self, index: usize) -> Result<&str>;

    /// Value of the column at `index` in the current row
    fn value(&self, index: usize) -> Result<DatabaseValue>;

    /// Release the cursor. Further reads return `false`.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
impl<C: DbConnection + ?Sized> DbConnection for Box<C> {
    fn database_type(&self) -> DatabaseType {
        (**self).database_type()
    }

    fn state(&self) -> ConnectionState {
        (**self).state()
    }

    async fn open(&mut self, cancel: &CancellationToken) -> Result<()> {
        (**self).open(cancel).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    async fn begin_transaction(
        &mut self,
        level: IsolationLevel,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn DbTransaction>> {
        (**self).begin_transaction(level, cancel).await
    }

    fn create_command(&mut self) -> Result<Box<dyn DbCommand>> {
        (**self).create_command()
    }
}
