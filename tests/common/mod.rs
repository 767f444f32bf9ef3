//! Scripted in-memory driver that records every primitive the executor calls

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_database_executor::core::{
    ConnectionState, DatabaseError, DatabaseType, DatabaseValue, DbCommand, DbConnection,
    DbTransaction, IsolationLevel, Parameter, Result, RowCursor,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Open,
    Close,
    Begin(IsolationLevel),
    CreateCommand,
    AddParameter(String),
    NonQuery(String),
    Scalar(String),
    Reader(String),
    CursorClose,
    Commit,
    Rollback,
}

/// Behaviour of a [`MockConnection`]
#[derive(Debug, Clone)]
pub struct Script {
    pub initial_state: Option<ConnectionState>,
    pub fail_open: bool,
    pub fail_begin: bool,
    pub fail_add_parameter: bool,
    pub fail_execute: bool,
    pub fail_read: bool,
    pub fail_commit: bool,
    pub fail_rollback: bool,
    /// Connection drops to `Closed` while the command executes
    pub drop_connection_on_execute: bool,
    /// Connection turns `Broken` while the command executes
    pub break_connection_on_execute: bool,
    /// Token cancelled as soon as the transaction begins
    pub cancel_on_begin: Option<CancellationToken>,
    pub affected: u64,
    pub scalar: DatabaseValue,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<DatabaseValue>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            initial_state: None,
            fail_open: false,
            fail_begin: false,
            fail_add_parameter: false,
            fail_execute: false,
            fail_read: false,
            fail_commit: false,
            fail_rollback: false,
            drop_connection_on_execute: false,
            break_connection_on_execute: false,
            cancel_on_begin: None,
            affected: 0,
            scalar: DatabaseValue::Null,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }
}

type Shared<T> = Arc<Mutex<T>>;

pub struct MockConnection {
    script: Script,
    state: Shared<ConnectionState>,
    events: Shared<Vec<Event>>,
}

impl MockConnection {
    pub fn new(script: Script) -> Self {
        Self {
            state: Arc::new(Mutex::new(
                script.initial_state.unwrap_or(ConnectionState::Closed),
            )),
            script,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle for inspecting events after the connection has been consumed
    pub fn events(&self) -> Shared<Vec<Event>> {
        Arc::clone(&self.events)
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

pub fn count(events: &Shared<Vec<Event>>, wanted: &Event) -> usize {
    events.lock().iter().filter(|e| *e == wanted).count()
}

#[async_trait]
impl DbConnection for MockConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::None
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn open(&mut self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DatabaseError::Cancelled);
        }
        self.record(Event::Open);
        if self.script.fail_open {
            return Err(DatabaseError::connection("refused"));
        }
        *self.state.lock() = ConnectionState::Open;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.record(Event::Close);
        *self.state.lock() = ConnectionState::Closed;
        Ok(())
    }

    async fn begin_transaction(
        &mut self,
        level: IsolationLevel,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn DbTransaction>> {
        self.record(Event::Begin(level));
        if self.script.fail_begin {
            return Err(DatabaseError::transaction("begin refused"));
        }
        if let Some(token) = &self.script.cancel_on_begin {
            token.cancel();
        }
        Ok(Box::new(MockTransaction {
            level,
            script: self.script.clone(),
            events: Arc::clone(&self.events),
        }))
    }

    fn create_command(&mut self) -> Result<Box<dyn DbCommand>> {
        self.record(Event::CreateCommand);
        Ok(Box::new(MockCommand {
            text: String::new(),
            parameters: Vec::new(),
            script: self.script.clone(),
            state: Arc::clone(&self.state),
            events: Arc::clone(&self.events),
        }))
    }
}

struct MockTransaction {
    level: IsolationLevel,
    script: Script,
    events: Shared<Vec<Event>>,
}

#[async_trait]
impl DbTransaction for MockTransaction {
    fn isolation_level(&self) -> IsolationLevel {
        self.level
    }

    async fn commit(&mut self) -> Result<()> {
        self.events.lock().push(Event::Commit);
        if self.script.fail_commit {
            return Err(DatabaseError::transaction("commit refused"));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.events.lock().push(Event::Rollback);
        if self.script.fail_rollback {
            return Err(DatabaseError::transaction("rollback refused"));
        }
        Ok(())
    }
}

struct MockCommand {
    text: String,
    parameters: Vec<Parameter>,
    script: Script,
    state: Shared<ConnectionState>,
    events: Shared<Vec<Event>>,
}

impl MockCommand {
    fn run(&self, event: Event) -> Result<()> {
        self.events.lock().push(event);
        if self.script.drop_connection_on_execute {
            *self.state.lock() = ConnectionState::Closed;
        }
        if self.script.break_connection_on_execute {
            *self.state.lock() = ConnectionState::Broken;
        }
        if self.script.fail_execute {
            return Err(DatabaseError::query("syntax error"));
        }
        Ok(())
    }
}

#[async_trait]
impl DbCommand for MockCommand {
    fn command_text(&self) -> &str {
        &self.text
    }

    fn set_command_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    fn add_parameter(&mut self, parameter: Parameter) -> Result<()> {
        self.events
            .lock()
            .push(Event::AddParameter(parameter.name.clone()));
        if self.script.fail_add_parameter {
            return Err(DatabaseError::invalid_argument("unsupported parameter"));
        }
        let value = parameter.resolved_value()?;
        self.parameters.push(Parameter { value, ..parameter });
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    async fn execute_non_query(&mut self) -> Result<u64> {
        self.run(Event::NonQuery(self.text.clone()))?;
        Ok(self.script.affected)
    }

    async fn execute_scalar(&mut self) -> Result<DatabaseValue> {
        self.run(Event::Scalar(self.text.clone()))?;
        Ok(self.script.scalar.clone())
    }

    async fn execute_reader(&mut self) -> Result<Box<dyn RowCursor>> {
        self.run(Event::Reader(self.text.clone()))?;
        Ok(Box::new(MockCursor {
            columns: self.script.columns.clone(),
            rows: self.script.rows.clone().into_iter(),
            current: None,
            fail_read: self.script.fail_read,
            events: Arc::clone(&self.events),
        }))
    }
}

struct MockCursor {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Vec<DatabaseValue>>,
    current: Option<Vec<DatabaseValue>>,
    fail_read: bool,
    events: Shared<Vec<Event>>,
}

#[async_trait]
impl RowCursor for MockCursor {
    async fn read(&mut self) -> Result<bool> {
        if self.fail_read {
            return Err(DatabaseError::query("cursor failed"));
        }
        self.current = self.rows.next();
        Ok(self.current.is_some())
    }

    fn field_count(&self) -> usize {
        self.columns.len()
    }

    fn name(&self, index: usize) -> Result<&str> {
        self.columns
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| DatabaseError::ColumnNotFound(index.to_string()))
    }

    fn value(&self, index: usize) -> Result<DatabaseValue> {
        self.current
            .as_ref()
            .and_then(|row| row.get(index).cloned())
            .ok_or_else(|| DatabaseError::ColumnNotFound(index.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.events.lock().push(Event::CursorClose);
        Ok(())
    }
}
