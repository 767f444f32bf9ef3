//! Transactional command execution
//!
//! Every public entry point here follows the same sequence: validate the request,
//! make sure the connection is open, begin a transaction, create and populate a
//! command, hand it to a body, then commit or roll back and release the connection.
//!
//! The entry points take the connection by value and close it before returning. To run
//! a command on a connection you want to keep using, pass
//! [`ConnectionExt::leave_open`] instead, which turns the final close into a no-op.

use super::connection::{ConnectionState, DbCommand, DbConnection, DbTransaction, RowCursor};
use super::database_types::DatabaseType;
use super::error::{DatabaseError, Result};
use super::isolation::IsolationLevel;
use super::request::CommandRequest;
use super::transaction::TransactionScope;
use super::value::{DatabaseResult, DatabaseRow, DatabaseValue, FromDatabaseValue};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Future returned by a command body
pub type CommandFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

/// Stages a single call moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandPhase {
    Created,
    ConnectionOpening,
    TransactionOpen,
    BodyExecuting,
    Committed,
    RolledBack,
    Released,
}

impl CommandPhase {
    /// Convert the phase to string representation
    pub fn to_str(&self) -> &'static str {
        match self {
            CommandPhase::Created => "created",
            CommandPhase::ConnectionOpening => "connection_opening",
            CommandPhase::TransactionOpen => "transaction_open",
            CommandPhase::BodyExecuting => "body_executing",
            CommandPhase::Committed => "committed",
            CommandPhase::RolledBack => "rolled_back",
            CommandPhase::Released => "released",
        }
    }
}

impl std::fmt::Display for CommandPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

fn enter(phase: CommandPhase) {
    debug!(target: "executor::command", phase = %phase, "Command phase");
}

/// Open the connection if it is not open yet
///
/// An open connection is left untouched. A broken connection is closed and reopened.
///
/// # Errors
///
/// Returns [`DatabaseError::Cancelled`] if `cancel` has fired, or the driver's error
/// if opening fails
pub async fn ensure_open<C>(connection: &mut C, cancel: &CancellationToken) -> Result<()>
where
    C: DbConnection + ?Sized,
{
    match connection.state() {
        ConnectionState::Open => Ok(()),
        state => {
            if cancel.is_cancelled() {
                return Err(DatabaseError::Cancelled);
            }
            if state == ConnectionState::Broken {
                debug!(target: "executor::connection", "Reopening broken connection");
                connection.close().await?;
            }
            connection.open(cancel).await?;
            debug!(
                target: "executor::connection",
                database = %connection.database_type(),
                "Connection opened"
            );
            Ok(())
        }
    }
}

async fn run_in_scope<C, F, T>(
    connection: &mut C,
    text: &str,
    request: &CommandRequest,
    body: F,
) -> Result<T>
where
    C: DbConnection + ?Sized,
    F: for<'c> FnOnce(&'c mut dyn DbCommand) -> CommandFuture<'c, T> + Send,
    T: Send,
{
    let cancel = request.cancellation_token().cloned().unwrap_or_default();

    enter(CommandPhase::ConnectionOpening);
    ensure_open(connection, &cancel).await?;

    let level = request.level();
    if cancel.is_cancelled() {
        return Err(DatabaseError::Cancelled);
    }
    if !connection.database_type().distinguishes(level) {
        debug!(
            target: "executor::txn",
            database = %connection.database_type(),
            level = %level,
            "Isolation level runs at a stricter engine level"
        );
    }
    let mut scope = TransactionScope::new(connection.begin_transaction(level, &cancel).await?);
    enter(CommandPhase::TransactionOpen);

    let outcome = async {
        let mut command = connection.create_command()?;
        for parameter in request.parameters() {
            command.add_parameter(parameter.clone())?;
        }
        command.set_command_text(text);

        if cancel.is_cancelled() {
            return Err(DatabaseError::Cancelled);
        }
        enter(CommandPhase::BodyExecuting);
        let value = body(&mut *command).await?;
        scope.commit().await?;
        Ok(value)
    }
    .await;

    match outcome {
        Ok(value) => {
            enter(CommandPhase::Committed);
            Ok(value)
        }
        Err(e) => {
            if connection.state() == ConnectionState::Open {
                if let Err(rollback_error) = scope.rollback().await {
                    warn!(
                        target: "executor::txn",
                        error = %rollback_error,
                        "Rollback failed after command error"
                    );
                }
                enter(CommandPhase::RolledBack);
            } else {
                warn!(
                    target: "executor::txn",
                    "Connection no longer open; skipping rollback"
                );
                scope.discard();
            }
            debug!(target: "executor::command", error = %e, "Command execution failed");
            Err(DatabaseError::command_failed(e))
        }
    }
}

async fn release<C: DbConnection + ?Sized>(connection: &mut C) {
    if connection.state() != ConnectionState::Closed {
        if let Err(e) = connection.close().await {
            warn!(target: "executor::connection", error = %e, "Failed to close connection");
        }
    }
    enter(CommandPhase::Released);
}

/// Run `body` against a fresh command inside a transaction
///
/// The body receives the command with its text and parameters already set. If the
/// body succeeds the transaction is committed and the body's value returned. If the
/// body, the parameter binding, or the commit fails, the transaction is rolled back
/// (when the connection is still open) and [`DatabaseError::CommandFailed`] is
/// returned with the original error as its source. The connection is closed before
/// this function returns.
///
/// # Errors
///
/// - [`DatabaseError::InvalidArgument`] if the request has no command text; nothing
///   is sent to the connection
/// - [`DatabaseError::Cancelled`] or a driver error if opening the connection or
///   beginning the transaction fails
/// - [`DatabaseError::CommandFailed`] for any failure inside the transaction
///
/// # Example
///
/// ```no_run
/// use rust_database_executor::prelude::*;
///
/// # async fn run() -> Result<()> {
/// let connection = Blocking::new(SqliteConnection::new(":memory:"));
/// let text = run_with_transaction(connection, CommandRequest::new("SELECT 'hi'"), |command| {
///     Box::pin(async move { command.execute_scalar().await })
/// })
/// .await?;
/// assert_eq!(text.as_str(), Some("hi"));
/// # Ok(())
/// # }
/// ```
pub async fn run_with_transaction<C, F, T>(
    mut connection: C,
    request: CommandRequest,
    body: F,
) -> Result<T>
where
    C: DbConnection,
    F: for<'c> FnOnce(&'c mut dyn DbCommand) -> CommandFuture<'c, T> + Send,
    T: Send,
{
    let text = request.validate()?.to_owned();
    enter(CommandPhase::Created);

    let result = run_in_scope(&mut connection, &text, &request, body).await;
    release(&mut connection).await;
    result
}

/// Execute a command that returns no rows and report the affected row count
///
/// The count is whatever the driver reports. SQLite reports `0` for read-only
/// statements and sums the changes of every statement in the text. PostgreSQL reports
/// the server's command tag, so `SELECT` counts the rows it returned.
pub async fn execute<C: DbConnection>(connection: C, request: CommandRequest) -> Result<u64> {
    run_with_transaction(connection, request, |command| {
        Box::pin(async move { command.execute_non_query().await })
    })
    .await
}

/// Execute a command and return the raw first column of the first row
pub async fn execute_scalar_value<C: DbConnection>(
    connection: C,
    request: CommandRequest,
) -> Result<DatabaseValue> {
    run_with_transaction(connection, request, |command| {
        Box::pin(async move { command.execute_scalar().await })
    })
    .await
}

/// Execute a command and coerce its scalar result to `T`
///
/// A null or missing result yields `T::default()`. Coercion happens after the
/// transaction has committed, so a coercion failure is returned as
/// [`DatabaseError::TypeMismatch`] without being wrapped.
pub async fn execute_scalar<C, T>(connection: C, request: CommandRequest) -> Result<T>
where
    C: DbConnection,
    T: FromDatabaseValue + Default,
{
    let raw = execute_scalar_value(connection, request).await?;
    if raw.is_null() {
        return Ok(T::default());
    }
    T::from_database_value(&raw)
}

/// Execute a command and materialize every result row
///
/// Rows keep the driver's column order. The cursor is closed before returning,
/// whether or not reading succeeded.
pub async fn execute_reader<C: DbConnection>(
    connection: C,
    request: CommandRequest,
) -> Result<DatabaseResult> {
    run_with_transaction(connection, request, |command| {
        Box::pin(async move {
            let mut cursor = command.execute_reader().await?;
            let rows = read_all(cursor.as_mut()).await;
            let closed = cursor.close().await;
            let rows = rows?;
            closed?;
            Ok::<_, DatabaseError>(rows)
        })
    })
    .await
}

async fn read_all(cursor: &mut dyn RowCursor) -> Result<DatabaseResult> {
    let mut rows = Vec::new();
    while cursor.read().await? {
        let field_count = cursor.field_count();
        let mut row = DatabaseRow::with_capacity(field_count);
        for index in 0..field_count {
            row.insert(cursor.name(index)?, cursor.value(index)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Command execution methods available on every [`DbConnection`]
///
/// ```no_run
/// use rust_database_executor::prelude::*;
///
/// # async fn run() -> Result<()> {
/// let mut connection = Blocking::new(SqliteConnection::new("app.db"));
///
/// connection
///     .leave_open()
///     .execute(CommandRequest::new("CREATE TABLE IF NOT EXISTS users (name TEXT)"))
///     .await?;
///
/// let users = connection
///     .execute_reader(CommandRequest::new("SELECT name FROM users"))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait ConnectionExt: DbConnection + Sized {
    /// See [`run_with_transaction`]
    async fn run_with_transaction<F, T>(self, request: CommandRequest, body: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut dyn DbCommand) -> CommandFuture<'c, T> + Send,
        T: Send;

    /// See [`execute`]
    async fn execute(self, request: CommandRequest) -> Result<u64>;

    /// See [`execute_scalar`]
    async fn execute_scalar<T>(self, request: CommandRequest) -> Result<T>
    where
        T: FromDatabaseValue + Default + Send;

    /// See [`execute_scalar_value`]
    async fn execute_scalar_value(self, request: CommandRequest) -> Result<DatabaseValue>;

    /// See [`execute_reader`]
    async fn execute_reader(self, request: CommandRequest) -> Result<DatabaseResult>;

    /// See [`ensure_open`]
    async fn ensure_open(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Borrow this connection so that a call leaves it open afterwards
    fn leave_open(&mut self) -> LeaveOpen<'_, Self> {
        LeaveOpen { inner: self }
    }
}

#[async_trait]
impl<C: DbConnection + Sized> ConnectionExt for C {
    async fn run_with_transaction<F, T>(self, request: CommandRequest, body: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut dyn DbCommand) -> CommandFuture<'c, T> + Send,
        T: Send,
    {
        run_with_transaction(self, request, body).await
    }

    async fn execute(self, request: CommandRequest) -> Result<u64> {
        execute(self, request).await
    }

    async fn execute_scalar<T>(self, request: CommandRequest) -> Result<T>
    where
        T: FromDatabaseValue + Default + Send,
    {
        execute_scalar(self, request).await
    }

    async fn execute_scalar_value(self, request: CommandRequest) -> Result<DatabaseValue> {
        execute_scalar_value(self, request).await
    }

    async fn execute_reader(self, request: CommandRequest) -> Result<DatabaseResult> {
        execute_reader(self, request).await
    }

    async fn ensure_open(&mut self, cancel: &CancellationToken) -> Result<()> {
        ensure_open(self, cancel).await
    }
}

/// A borrowed connection whose `close` does nothing while the connection is healthy
///
/// A broken connection cannot be left open usefully, so `close` still reaches it.
/// Created by [`ConnectionExt::leave_open`].
pub struct LeaveOpen<'a, C: DbConnection + ?Sized> {
    inner: &'a mut C,
}

#[async_trait]
impl<'a, C: DbConnection + ?Sized> DbConnection for LeaveOpen<'a, C> {
    fn database_type(&self) -> DatabaseType {
        self.inner.database_type()
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    async fn open(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.inner.open(cancel).await
    }

    async fn close(&mut self) -> Result<()> {
        match self.inner.state() {
            ConnectionState::Broken => self.inner.close().await,
            _ => Ok(()),
        }
    }

    async fn begin_transaction(
        &mut self,
        level: IsolationLevel,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn DbTransaction>> {
        self.inner.begin_transaction(level, cancel).await
    }

    fn create_command(&mut self) -> Result<Box<dyn DbCommand>> {
        self.inner.create_command()
    }
}
