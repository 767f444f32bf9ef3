//! Blocking driver contract and its async adapter
//!
//! Drivers whose primitives are synchronous implement the traits in this module.
//! [`Blocking`] wraps such a driver and implements the async
//! [`DbConnection`](super::connection::DbConnection) contract by running every
//! primitive on tokio's blocking thread pool, bounded by the configured timeouts.
//!
//! # Cancellation
//!
//! Open and begin-transaction stop waiting as soon as the cancellation signal fires.
//! A primitive abandoned by cancellation or a timeout is interrupted when the driver
//! provides an [`Interrupter`]; otherwise it keeps running on its worker thread until
//! it returns and its result is discarded. Either way the connection reports
//! [`ConnectionState::Broken`] until it has been closed, so callers never wait on the
//! abandoned work from an async context.

use super::config::ExecutorConfig;
use super::connection::{ConnectionState, DbCommand, DbConnection, DbTransaction, RowCursor};
use super::database_types::DatabaseType;
use super::error::{DatabaseError, Result};
use super::isolation::IsolationLevel;
use super::parameter::Parameter;
use super::value::DatabaseValue;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Stops a running primitive from another thread
pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

/// A connection whose primitives block the calling thread
pub trait BlockingConnection: Send + 'static {
    /// Transaction handle produced by [`BlockingConnection::begin_transaction`]
    type Transaction: BlockingTransaction;
    /// Command handle produced by [`BlockingConnection::create_command`]
    type Command: BlockingCommand;

    /// The kind of database behind this connection
    fn database_type(&self) -> DatabaseType;

    /// Current lifecycle state
    fn state(&self) -> ConnectionState;

    /// Open the connection
    fn open(&mut self) -> Result<()>;

    /// Close the connection
    fn close(&mut self) -> Result<()>;

    /// Begin a transaction
    fn begin_transaction(&mut self, level: IsolationLevel) -> Result<Self::Transaction>;

    /// Handle that aborts whatever statement the open connection is running
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }

    /// Create a command handle bound to this connection
    fn create_command(&mut self) -> Result<Self::Command>;
}

/// Executes command text against a blocking connection
///
/// The adapter owns the command text and parameters and hands them over on each call.
pub trait BlockingCommand: Send + 'static {
    /// Cursor produced by [`BlockingCommand::execute_reader`]
    type Cursor: BlockingCursor;

    /// Execute without reading rows, returning the affected row count
    fn execute_non_query(&mut self, text: &str, parameters: &[Parameter]) -> Result<u64>;

    /// Execute and return the first column of the first row
    fn execute_scalar(&mut self, text: &str, parameters: &[Parameter]) -> Result<DatabaseValue>;

    /// Execute and return a cursor over the rows
    fn execute_reader(&mut self, text: &str, parameters: &[Parameter]) -> Result<Self::Cursor>;
}

/// A blocking transaction handle
pub trait BlockingTransaction: Send + 'static {
    /// The isolation level the transaction was started with
    fn isolation_level(&self) -> IsolationLevel;

    /// Commit the transaction
    fn commit(&mut self) -> Result<()>;

    /// Roll back the transaction
    fn rollback(&mut self) -> Result<()>;
}

/// A blocking forward-only cursor
pub trait BlockingCursor: Send + 'static {
    /// Advance to the next row
    fn read(&mut self) -> Result<bool>;

    /// Number of columns
    fn field_count(&self) -> usize;

    /// Name of the column at `index`
    fn name(&self, index: usize) -> Result<String>;

    /// Value of the column at `index` in the current row
    fn value(&self, index: usize) -> Result<DatabaseValue>;

    /// Release the cursor
    fn close(&mut self) -> Result<()>;
}

/// Adapter-side view of the connection
///
/// Readable from async code without touching the driver, whose locks may be held by
/// a primitive still running on the blocking pool.
#[derive(Clone)]
struct Tracker {
    state: Arc<Mutex<ConnectionState>>,
    interrupter: Arc<Mutex<Option<Interrupter>>>,
}

impl Tracker {
    fn new(state: ConnectionState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            interrupter: Arc::new(Mutex::new(None)),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Record a completed open; an abandoned connection stays broken until closed
    fn opened(&self, state: ConnectionState, interrupter: Option<Interrupter>) {
        let mut current = self.state.lock();
        if *current != ConnectionState::Broken {
            *current = state;
        }
        *self.interrupter.lock() = interrupter;
    }

    /// Record a completed close
    fn closed(&self, state: ConnectionState) {
        *self.state.lock() = state;
        if state != ConnectionState::Open {
            *self.interrupter.lock() = None;
        }
    }

    fn abandon(&self) {
        *self.state.lock() = ConnectionState::Broken;
        let interrupter = self.interrupter.lock().clone();
        if let Some(interrupt) = interrupter {
            interrupt();
        }
        warn!(
            target: "executor::blocking",
            "Abandoned a running primitive; connection marked broken"
        );
    }
}

/// Run a blocking closure on the blocking pool with a timeout and optional cancellation
///
/// If the wait ends before the closure does, the connection is marked broken.
async fn run_blocking<F, R>(
    timeout: Duration,
    on_timeout: fn(u64) -> DatabaseError,
    cancel: Option<&CancellationToken>,
    tracker: &Tracker,
    f: F,
) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(DatabaseError::Cancelled);
    }
    let cancel = cancel.cloned().unwrap_or_default();

    let mut task = tokio::task::spawn_blocking(f);

    // Use select! to abort task on timeout or cancellation
    tokio::select! {
        result = &mut task => {
            result.map_err(|e| DatabaseError::other(format!("Task join error: {}", e)))?
        }
        _ = cancel.cancelled() => {
            task.abort();
            tracker.abandon();
            Err(DatabaseError::Cancelled)
        }
        _ = tokio::time::sleep(timeout) => {
            task.abort();
            tracker.abandon();
            Err(on_timeout(timeout.as_millis() as u64))
        }
    }
}

/// Timeout and tracker shared by the handles a [`Blocking`] connection hands out
#[derive(Clone)]
struct Runner {
    timeout: Duration,
    tracker: Tracker,
}

impl Runner {
    async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        run_blocking(
            self.timeout,
            DatabaseError::operation_timeout,
            None,
            &self.tracker,
            f,
        )
        .await
    }
}

/// Async adapter over a [`BlockingConnection`]
///
/// # Example
///
/// ```no_run
/// use rust_database_executor::prelude::*;
///
/// # async fn run() -> Result<()> {
/// let connection = Blocking::new(SqliteConnection::new(":memory:"));
/// let affected = connection.execute(CommandRequest::new("SELECT 1;")).await?;
/// assert_eq!(affected, 0);
/// # Ok(())
/// # }
/// ```
pub struct Blocking<C: BlockingConnection> {
    inner: Arc<Mutex<C>>,
    database_type: DatabaseType,
    tracker: Tracker,
    config: ExecutorConfig,
}

impl<C: BlockingConnection> Blocking<C> {
    /// Wrap a blocking connection with default timeouts
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, ExecutorConfig::default())
    }

    /// Wrap a blocking connection with explicit configuration
    pub fn with_config(connection: C, config: ExecutorConfig) -> Self {
        Self {
            database_type: connection.database_type(),
            tracker: Tracker::new(connection.state()),
            inner: Arc::new(Mutex::new(connection)),
            config,
        }
    }

    /// The configuration in effect
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn runner(&self) -> Runner {
        Runner {
            timeout: self.config.operation_timeout,
            tracker: self.tracker.clone(),
        }
    }
}

#[async_trait]
impl<C: BlockingConnection> DbConnection for Blocking<C> {
    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    fn state(&self) -> ConnectionState {
        self.tracker.state()
    }

    async fn open(&mut self, cancel: &CancellationToken) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let tracker = self.tracker.clone();
        run_blocking(
            self.config.connect_timeout,
            DatabaseError::connection_timeout,
            Some(cancel),
            &self.tracker,
            move || {
                let mut connection = inner.lock();
                connection.open()?;
                tracker.opened(connection.state(), connection.interrupter());
                Ok(())
            },
        )
        .await
    }

    async fn close(&mut self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let tracker = self.tracker.clone();
        run_blocking(
            self.config.operation_timeout,
            DatabaseError::operation_timeout,
            None,
            &self.tracker,
            move || {
                let mut connection = inner.lock();
                let result = connection.close();
                tracker.closed(connection.state());
                result
            },
        )
        .await
    }

    async fn begin_transaction(
        &mut self,
        level: IsolationLevel,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn DbTransaction>> {
        let inner = Arc::clone(&self.inner);
        let transaction = run_blocking(
            self.config.operation_timeout,
            DatabaseError::operation_timeout,
            Some(cancel),
            &self.tracker,
            move || inner.lock().begin_transaction(level),
        )
        .await?;

        Ok(Box::new(BlockingTransactionHandle {
            level: transaction.isolation_level(),
            inner: Arc::new(Mutex::new(transaction)),
            runner: self.runner(),
        }))
    }

    fn create_command(&mut self) -> Result<Box<dyn DbCommand>> {
        if self.tracker.state() != ConnectionState::Open {
            return Err(DatabaseError::connection("Connection is not open"));
        }
        let command = self.inner.lock().create_command()?;
        Ok(Box::new(BlockingCommandHandle {
            inner: Arc::new(Mutex::new(command)),
            text: String::new(),
            parameters: Vec::new(),
            runner: self.runner(),
        }))
    }
}

struct BlockingTransactionHandle<T: BlockingTransaction> {
    inner: Arc<Mutex<T>>,
    level: IsolationLevel,
    runner: Runner,
}

#[async_trait]
impl<T: BlockingTransaction> DbTransaction for BlockingTransactionHandle<T> {
    fn isolation_level(&self) -> IsolationLevel {
        self.level
    }

    async fn commit(&mut self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.runner.run(move || inner.lock().commit()).await
    }

    async fn rollback(&mut self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.runner.run(move || inner.lock().rollback()).await
    }
}

struct BlockingCommandHandle<Cmd: BlockingCommand> {
    inner: Arc<Mutex<Cmd>>,
    text: String,
    parameters: Vec<Parameter>,
    runner: Runner,
}

impl<Cmd: BlockingCommand> BlockingCommandHandle<Cmd> {
    async fn run<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Cmd, &str, &[Parameter]) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let text = self.text.clone();
        let parameters = self.parameters.clone();
        self.runner
            .run(move || {
                let mut command = inner.lock();
                f(&mut *command, text.as_str(), parameters.as_slice())
            })
            .await
    }
}

#[async_trait]
impl<Cmd: BlockingCommand> DbCommand for BlockingCommandHandle<Cmd> {
    fn command_text(&self) -> &str {
        &self.text
    }

    fn set_command_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    fn add_parameter(&mut self, parameter: Parameter) -> Result<()> {
        let value = parameter.resolved_value()?;
        self.parameters.push(Parameter { value, ..parameter });
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    async fn execute_non_query(&mut self) -> Result<u64> {
        self.run(|cmd, text, parameters| cmd.execute_non_query(text, parameters))
            .await
    }

    async fn execute_scalar(&mut self) -> Result<DatabaseValue> {
        self.run(|cmd, text, parameters| cmd.execute_scalar(text, parameters))
            .await
    }

    async fn execute_reader(&mut self) -> Result<Box<dyn RowCursor>> {
        let (cursor, names) = self
            .run(|cmd, text, parameters| {
                let cursor = cmd.execute_reader(text, parameters)?;
                let names = (0..cursor.field_count())
                    .map(|i| cursor.name(i))
                    .collect::<Result<Vec<_>>>()?;
                Ok((cursor, names))
            })
            .await?;

        Ok(Box::new(BlockingCursorHandle {
            inner: Some(Arc::new(Mutex::new(cursor))),
            names,
            current: Vec::new(),
            runner: self.runner.clone(),
        }))
    }
}

struct BlockingCursorHandle<Cur: BlockingCursor> {
    inner: Option<Arc<Mutex<Cur>>>,
    names: Vec<String>,
    current: Vec<DatabaseValue>,
    runner: Runner,
}

#[async_trait]
impl<Cur: BlockingCursor> RowCursor for BlockingCursorHandle<Cur> {
    async fn read(&mut self) -> Result<bool> {
        let Some(inner) = self.inner.as_ref().map(Arc::clone) else {
            return Ok(false);
        };

        let row = self
            .runner
            .run(move || {
                let mut cursor = inner.lock();
                if !cursor.read()? {
                    return Ok(None);
                }
                (0..cursor.field_count())
                    .map(|i| cursor.value(i))
                    .collect::<Result<Vec<_>>>()
                    .map(Some)
            })
            .await?;

        match row {
            Some(values) => {
                self.current = values;
                Ok(true)
            }
            None => {
                self.current.clear();
                Ok(false)
            }
        }
    }

    fn field_count(&self) -> usize {
        self.names.len()
    }

    fn name(&self, index: usize) -> Result<&str> {
        self.names
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| DatabaseError::ColumnNotFound(format!("index {}", index)))
    }

    fn value(&self, index: usize) -> Result<DatabaseValue> {
        self.current
            .get(index)
            .cloned()
            .ok_or_else(|| DatabaseError::ColumnNotFound(format!("index {}", index)))
    }

    async fn close(&mut self) -> Result<()> {
        self.current.clear();
        match self.inner.take() {
            Some(inner) => {
                self.runner.run(move || inner.lock().close()).await
            }
            None => Ok(()),
        }
    }
}
