//! SQLite driver
//!
//! rusqlite is synchronous, so this driver implements the blocking contract and is
//! used through [`Blocking`](crate::core::blocking::Blocking).
//!
//! SQLite has no per-transaction isolation levels. Requests map onto what the engine
//! offers:
//!
//! | Requested | Statements |
//! |-----------|------------|
//! | `ReadUncommitted` | `BEGIN DEFERRED`, `PRAGMA read_uncommitted = 1` |
//! | `ReadCommitted`, `RepeatableRead`, `Snapshot` | `BEGIN DEFERRED` |
//! | `Serializable` | `BEGIN IMMEDIATE` |

use crate::core::{
    blocking::{
        BlockingCommand, BlockingConnection, BlockingCursor, BlockingTransaction, Interrupter,
    },
    connection::ConnectionState,
    database_types::DatabaseType,
    error::{DatabaseError, Result},
    isolation::IsolationLevel,
    parameter::Parameter,
    value::DatabaseValue,
};
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Batch, Connection, InterruptHandle, Statement, ToSql};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Text format used to bind timestamps, matching `CURRENT_TIMESTAMP` plus fractions
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

type SharedConnection = Arc<Mutex<Option<Connection>>>;

fn not_connected() -> DatabaseError {
    DatabaseError::connection("Not connected to database")
}

/// SQLite connection
///
/// `path` is passed to [`Connection::open`]; use `":memory:"` for a private in-memory
/// database. An in-memory database lives only as long as the connection stays open.
pub struct SqliteConnection {
    path: String,
    busy_timeout: Option<Duration>,
    connection: SharedConnection,
    interrupt: Option<Arc<InterruptHandle>>,
}

impl SqliteConnection {
    /// Create a closed connection to the database at `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: None,
            connection: Arc::new(Mutex::new(None)),
            interrupt: None,
        }
    }

    /// Wait up to `timeout` for locks held by other connections
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = Some(timeout);
        self
    }

    /// Database path this connection opens
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl BlockingConnection for SqliteConnection {
    type Transaction = SqliteTransaction;
    type Command = SqliteCommand;

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    fn state(&self) -> ConnectionState {
        if self.connection.lock().is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    fn open(&mut self) -> Result<()> {
        let mut slot = self.connection.lock();
        if slot.is_some() {
            return Ok(());
        }

        let conn = Connection::open(&self.path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        if let Some(timeout) = self.busy_timeout {
            conn.busy_timeout(timeout)?;
        }
        self.interrupt = Some(Arc::new(conn.get_interrupt_handle()));
        *slot = Some(conn);
        debug!(target: "executor::sqlite", path = %self.path, "Opened SQLite database");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(conn) = self.connection.lock().take() else {
            return Ok(());
        };
        self.interrupt = None;
        conn.close().map_err(|(_, e)| DatabaseError::from(e))?;
        debug!(target: "executor::sqlite", path = %self.path, "Closed SQLite database");
        Ok(())
    }

    fn begin_transaction(&mut self, level: IsolationLevel) -> Result<SqliteTransaction> {
        let guard = self.connection.lock();
        let conn = guard.as_ref().ok_or_else(not_connected)?;

        let begin = match level {
            IsolationLevel::Serializable => "BEGIN IMMEDIATE",
            IsolationLevel::ReadUncommitted
            | IsolationLevel::ReadCommitted
            | IsolationLevel::RepeatableRead
            | IsolationLevel::Snapshot => "BEGIN DEFERRED",
        };
        conn.execute_batch(begin)?;

        // Only touch the pragma once a transaction exists to reset it
        if level == IsolationLevel::ReadUncommitted {
            if let Err(e) = conn.execute_batch("PRAGMA read_uncommitted = 1") {
                if let Err(rollback_error) = conn.execute_batch("ROLLBACK") {
                    warn!(
                        target: "executor::sqlite",
                        error = %rollback_error,
                        "Rollback after failed begin failed"
                    );
                }
                return Err(e.into());
            }
        }

        Ok(SqliteTransaction {
            connection: Arc::clone(&self.connection),
            level,
            finished: false,
        })
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let handle = Arc::clone(self.interrupt.as_ref()?);
        Some(Arc::new(move || handle.interrupt()))
    }

    fn create_command(&mut self) -> Result<SqliteCommand> {
        if self.connection.lock().is_none() {
            return Err(not_connected());
        }
        Ok(SqliteCommand {
            connection: Arc::clone(&self.connection),
        })
    }
}

/// Transaction on a [`SqliteConnection`]
///
/// Rolled back on drop if neither committed nor rolled back.
pub struct SqliteTransaction {
    connection: SharedConnection,
    level: IsolationLevel,
    finished: bool,
}

impl SqliteTransaction {
    fn finish(&mut self, statement: &str) -> Result<()> {
        let guard = self.connection.lock();
        let conn = guard.as_ref().ok_or_else(not_connected)?;
        conn.execute_batch(statement)?;
        self.finished = true;

        if self.level == IsolationLevel::ReadUncommitted {
            conn.execute_batch("PRAGMA read_uncommitted = 0")?;
        }
        Ok(())
    }
}

impl BlockingTransaction for SqliteTransaction {
    fn isolation_level(&self) -> IsolationLevel {
        self.level
    }

    fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        let result = self.finish("ROLLBACK");
        self.finished = true;
        result
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Best effort: Drop cannot wait for a lock held elsewhere
        if let Some(guard) = self.connection.try_lock() {
            if let Some(conn) = guard.as_ref() {
                if !conn.is_autocommit() {
                    if let Err(e) = conn.execute_batch("ROLLBACK") {
                        warn!(target: "executor::sqlite", error = %e, "Rollback on drop failed");
                    }
                }
            }
        }
    }
}

/// Command handle on a [`SqliteConnection`]
pub struct SqliteCommand {
    connection: SharedConnection,
}

impl SqliteCommand {
    /// Prepare, bind and hand each statement in `text` to `f`, in order
    ///
    /// A statement is only prepared once the ones before it have run, so later
    /// statements may refer to objects created by earlier ones.
    fn for_each_statement(
        &self,
        text: &str,
        parameters: &[Parameter],
        mut f: impl FnMut(&Connection, &mut Statement<'_>) -> Result<()>,
    ) -> Result<()> {
        let guard = self.connection.lock();
        let conn = guard.as_ref().ok_or_else(not_connected)?;

        let mut bound = vec![false; parameters.len()];
        let mut batch = Batch::new(conn, text);
        while let Some(mut statement) = batch.next()? {
            bind_parameters(&mut statement, parameters, &mut bound)?;
            f(conn, &mut statement)?;
        }

        match bound.iter().position(|b| !b) {
            Some(position) => Err(DatabaseError::query(format!(
                "Parameter '{}' has no matching placeholder",
                parameters[position].name
            ))),
            None => Ok(()),
        }
    }
}

/// Bind parameters by placeholder name when one matches, otherwise by position
///
/// Positional binding never overrides a placeholder already bound by name.
/// `bound` records which parameters found a placeholder in any statement.
fn bind_parameters(
    statement: &mut Statement<'_>,
    parameters: &[Parameter],
    bound: &mut [bool],
) -> Result<()> {
    let placeholders = statement.parameter_count();
    let mut taken = vec![false; placeholders + 1];
    let mut unnamed = Vec::new();

    for (position, parameter) in parameters.iter().enumerate() {
        match placeholder_index(statement, parameter.bare_name())? {
            Some(index) => {
                statement.raw_bind_parameter(index, &parameter.value)?;
                taken[index] = true;
                bound[position] = true;
            }
            None => unnamed.push(position),
        }
    }

    for position in unnamed {
        let index = position + 1;
        if index <= placeholders && !taken[index] {
            statement.raw_bind_parameter(index, &parameters[position].value)?;
            bound[position] = true;
        }
    }
    Ok(())
}

fn placeholder_index(statement: &Statement<'_>, name: &str) -> Result<Option<usize>> {
    if name.is_empty() {
        return Ok(None);
    }
    for prefix in [':', '@', '$'] {
        if let Some(index) = statement.parameter_index(&format!("{}{}", prefix, name))? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Run a statement to completion, returning the rows it changed
fn run_to_end(conn: &Connection, statement: &mut Statement<'_>) -> Result<u64> {
    if statement.column_count() == 0 {
        return Ok(statement.raw_execute()? as u64);
    }

    // Row-returning statement: step through it so side effects apply
    let mut rows = statement.raw_query();
    while rows.next()?.is_some() {}
    drop(rows);

    if statement.readonly() {
        Ok(0)
    } else {
        Ok(conn.changes() as u64)
    }
}

/// Commands may hold several `;`-separated statements. All of them run, in order.
/// Scalar and reader results come from the first statement that returns columns.
impl BlockingCommand for SqliteCommand {
    type Cursor = SqliteCursor;

    fn execute_non_query(&mut self, text: &str, parameters: &[Parameter]) -> Result<u64> {
        let mut affected = 0;
        self.for_each_statement(text, parameters, |conn, statement| {
            affected += run_to_end(conn, statement)?;
            Ok(())
        })?;
        Ok(affected)
    }

    fn execute_scalar(&mut self, text: &str, parameters: &[Parameter]) -> Result<DatabaseValue> {
        let mut scalar = None;
        self.for_each_statement(text, parameters, |conn, statement| {
            if scalar.is_some() || statement.column_count() == 0 {
                run_to_end(conn, statement)?;
                return Ok(());
            }

            let mut rows = statement.raw_query();
            let value = match rows.next()? {
                Some(row) => from_value_ref(row.get_ref(0)?),
                None => DatabaseValue::Null,
            };
            while rows.next()?.is_some() {}
            scalar = Some(value);
            Ok(())
        })?;
        Ok(scalar.unwrap_or(DatabaseValue::Null))
    }

    fn execute_reader(&mut self, text: &str, parameters: &[Parameter]) -> Result<SqliteCursor> {
        let mut cursor: Option<SqliteCursor> = None;
        self.for_each_statement(text, parameters, |conn, statement| {
            if cursor.is_some() || statement.column_count() == 0 {
                run_to_end(conn, statement)?;
                return Ok(());
            }

            let names: Vec<String> = statement
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();

            let mut rows = VecDeque::new();
            let mut raw = statement.raw_query();
            while let Some(row) = raw.next()? {
                let values = (0..names.len())
                    .map(|i| row.get_ref(i).map(from_value_ref))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.push_back(values);
            }

            cursor = Some(SqliteCursor {
                names,
                rows,
                current: None,
            });
            Ok(())
        })?;

        Ok(cursor.unwrap_or_else(|| SqliteCursor {
            names: Vec::new(),
            rows: VecDeque::new(),
            current: None,
        }))
    }
}

/// Cursor over a fully read SQLite result set
///
/// Rows are read while the connection lock is held, so the cursor itself never
/// touches the connection.
pub struct SqliteCursor {
    names: Vec<String>,
    rows: VecDeque<Vec<DatabaseValue>>,
    current: Option<Vec<DatabaseValue>>,
}

impl BlockingCursor for SqliteCursor {
    fn read(&mut self) -> Result<bool> {
        self.current = self.rows.pop_front();
        Ok(self.current.is_some())
    }

    fn field_count(&self) -> usize {
        self.names.len()
    }

    fn name(&self, index: usize) -> Result<String> {
        self.names
            .get(index)
            .cloned()
            .ok_or_else(|| DatabaseError::ColumnNotFound(format!("index {}", index)))
    }

    fn value(&self, index: usize) -> Result<DatabaseValue> {
        self.current
            .as_ref()
            .and_then(|row| row.get(index))
            .cloned()
            .ok_or_else(|| DatabaseError::ColumnNotFound(format!("index {}", index)))
    }

    fn close(&mut self) -> Result<()> {
        self.rows.clear();
        self.current = None;
        Ok(())
    }
}

fn from_value_ref(value: ValueRef<'_>) -> DatabaseValue {
    match value {
        ValueRef::Null => DatabaseValue::Null,
        ValueRef::Integer(v) => DatabaseValue::Long(v),
        ValueRef::Real(v) => DatabaseValue::Double(v),
        ValueRef::Text(v) => DatabaseValue::String(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => DatabaseValue::Bytes(v.to_vec()),
    }
}

impl ToSql for DatabaseValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            DatabaseValue::Null => ToSqlOutput::Owned(Value::Null),
            DatabaseValue::Bool(v) => ToSqlOutput::Owned(Value::Integer(i64::from(*v))),
            DatabaseValue::Int(v) => ToSqlOutput::Owned(Value::Integer(i64::from(*v))),
            DatabaseValue::Long(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            DatabaseValue::Float(v) => ToSqlOutput::Owned(Value::Real(f64::from(*v))),
            DatabaseValue::Double(v) => ToSqlOutput::Owned(Value::Real(*v)),
            DatabaseValue::String(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            DatabaseValue::Bytes(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            DatabaseValue::Timestamp(_) => {
                let timestamp = self.as_datetime().ok_or_else(|| {
                    rusqlite::Error::ToSqlConversionFailure(
                        format!("timestamp out of range: {:?}", self).into(),
                    )
                })?;
                ToSqlOutput::Owned(Value::Text(
                    timestamp.format(TIMESTAMP_FORMAT).to_string(),
                ))
            }
        })
    }
}
