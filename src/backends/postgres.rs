//! PostgreSQL driver
//!
//! tokio-postgres is natively async, so this driver implements
//! [`DbConnection`] directly. Every primitive is bounded by the configured operation
//! timeout; open and begin also stop at the caller's cancellation signal.
//!
//! Parameters bind positionally to `$1, $2, ...` in the order they were added.

use crate::core::{
    config::ExecutorConfig,
    connection::{ConnectionState, DbCommand, DbConnection, DbTransaction, RowCursor},
    database_types::DatabaseType,
    error::{DatabaseError, Result},
    isolation::IsolationLevel,
    parameter::Parameter,
    value::DatabaseValue,
};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::collections::VecDeque;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

async fn bounded<T, F>(
    timeout: Duration,
    cancel: Option<&CancellationToken>,
    future: F,
) -> Result<T>
where
    F: Future<Output = std::result::Result<T, tokio_postgres::Error>>,
{
    let cancel = cancel.cloned().unwrap_or_default();
    if cancel.is_cancelled() {
        return Err(DatabaseError::Cancelled);
    }

    tokio::select! {
        result = tokio::time::timeout(timeout, future) => {
            result
                .map_err(|_| DatabaseError::operation_timeout(timeout.as_millis() as u64))?
                .map_err(DatabaseError::from)
        }
        _ = cancel.cancelled() => Err(DatabaseError::Cancelled),
    }
}

fn not_connected() -> DatabaseError {
    DatabaseError::connection("Not connected to database")
}

/// PostgreSQL connection
///
/// ```no_run
/// use rust_database_executor::prelude::*;
/// use rust_database_executor::backends::PostgresConnection;
///
/// # async fn run() -> Result<()> {
/// let connection_string = ConnectionBuilder::new(DatabaseType::Postgres)
///     .host("localhost")
///     .database("app")
///     .username("app")
///     .build_connection_string();
///
/// let count: i64 = PostgresConnection::new(connection_string)
///     .execute_scalar(CommandRequest::new("SELECT COUNT(*) FROM users"))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct PostgresConnection {
    connection_string: String,
    config: ExecutorConfig,
    client: Option<Arc<Client>>,
}

impl PostgresConnection {
    /// Create a closed connection with default timeouts
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self::with_config(connection_string, ExecutorConfig::default())
    }

    /// Create a closed connection with explicit configuration
    pub fn with_config(connection_string: impl Into<String>, config: ExecutorConfig) -> Self {
        Self {
            connection_string: connection_string.into(),
            config,
            client: None,
        }
    }

    fn client(&self) -> Result<Arc<Client>> {
        self.client.as_ref().map(Arc::clone).ok_or_else(not_connected)
    }
}

#[async_trait]
impl DbConnection for PostgresConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn state(&self) -> ConnectionState {
        match &self.client {
            None => ConnectionState::Closed,
            Some(client) if client.is_closed() => ConnectionState::Broken,
            Some(_) => ConnectionState::Open,
        }
    }

    async fn open(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.state() == ConnectionState::Open {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(DatabaseError::Cancelled);
        }

        let timeout = self.config.connect_timeout;
        let connect = tokio_postgres::connect(&self.connection_string, NoTls);
        let (client, connection) = tokio::select! {
            result = tokio::time::timeout(timeout, connect) => {
                result
                    .map_err(|_| DatabaseError::connection_timeout(timeout.as_millis() as u64))?
                    .map_err(|e| DatabaseError::connection(e.to_string()))?
            }
            _ = cancel.cancelled() => return Err(DatabaseError::Cancelled),
        };

        // Spawn the connection handler in the background
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(target: "executor::postgres", error = %e, "PostgreSQL connection error");
            }
        });

        self.client = Some(Arc::new(client));
        debug!(target: "executor::postgres", "Connected to PostgreSQL");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.client.take().is_some() {
            debug!(target: "executor::postgres", "Disconnected from PostgreSQL");
        }
        Ok(())
    }

    async fn begin_transaction(
        &mut self,
        level: IsolationLevel,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn DbTransaction>> {
        let client = self.client()?;
        let begin = format!("BEGIN ISOLATION LEVEL {}", level.sql_phrase());
        bounded(
            self.config.operation_timeout,
            Some(cancel),
            client.batch_execute(&begin),
        )
        .await?;

        Ok(Box::new(PostgresTransaction {
            client,
            level,
            timeout: self.config.operation_timeout,
        }))
    }

    fn create_command(&mut self) -> Result<Box<dyn DbCommand>> {
        Ok(Box::new(PostgresCommand {
            client: self.client()?,
            text: String::new(),
            parameters: Vec::new(),
            timeout: self.config.operation_timeout,
        }))
    }
}

struct PostgresTransaction {
    client: Arc<Client>,
    level: IsolationLevel,
    timeout: Duration,
}

#[async_trait]
impl DbTransaction for PostgresTransaction {
    fn isolation_level(&self) -> IsolationLevel {
        self.level
    }

    async fn commit(&mut self) -> Result<()> {
        bounded(self.timeout, None, self.client.batch_execute("COMMIT")).await
    }

    async fn rollback(&mut self) -> Result<()> {
        bounded(self.timeout, None, self.client.batch_execute("ROLLBACK")).await
    }
}

struct PostgresCommand {
    client: Arc<Client>,
    text: String,
    parameters: Vec<Parameter>,
    timeout: Duration,
}

impl PostgresCommand {
    async fn query(&self) -> Result<Vec<Row>> {
        let params = param_refs(&self.parameters);
        bounded(self.timeout, None, self.client.query(self.text.as_str(), &params)).await
    }
}

fn param_refs(parameters: &[Parameter]) -> Vec<&(dyn ToSql + Sync)> {
    parameters
        .iter()
        .map(|p| &p.value as &(dyn ToSql + Sync))
        .collect()
}

#[async_trait]
impl DbCommand for PostgresCommand {
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
        let params = param_refs(&self.parameters);
        bounded(
            self.timeout,
            None,
            self.client.execute(self.text.as_str(), &params),
        )
        .await
    }

    async fn execute_scalar(&mut self) -> Result<DatabaseValue> {
        let rows = self.query().await?;
        match rows.first() {
            Some(row) if !row.is_empty() => column_value(row, 0),
            _ => Ok(DatabaseValue::Null),
        }
    }

    async fn execute_reader(&mut self) -> Result<Box<dyn RowCursor>> {
        let rows = self.query().await?;
        let names = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => Vec::new(),
        };
        Ok(Box::new(PostgresCursor {
            names,
            rows: rows.into(),
            current: Vec::new(),
        }))
    }
}

struct PostgresCursor {
    names: Vec<String>,
    rows: VecDeque<Row>,
    current: Vec<DatabaseValue>,
}

#[async_trait]
impl RowCursor for PostgresCursor {
    async fn read(&mut self) -> Result<bool> {
        match self.rows.pop_front() {
            Some(row) => {
                self.current = (0..row.len())
                    .map(|i| column_value(&row, i))
                    .collect::<Result<Vec<_>>>()?;
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
        self.rows.clear();
        self.current.clear();
        Ok(())
    }
}

fn column_value(row: &Row, idx: usize) -> Result<DatabaseValue> {
    let column_type = row.columns()[idx].type_().clone();
    let value = match column_type {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(DatabaseValue::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| DatabaseValue::Int(i32::from(v))),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(DatabaseValue::Int),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(DatabaseValue::Long),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| DatabaseValue::Long(i64::from(v))),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(DatabaseValue::Float),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(DatabaseValue::Double),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(DatabaseValue::Bytes),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| DatabaseValue::Timestamp(v.timestamp_micros())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| DatabaseValue::Timestamp(v.and_utc().timestamp_micros())),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(|v| {
            DatabaseValue::Timestamp(v.and_time(NaiveTime::MIN).and_utc().timestamp_micros())
        }),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)?
            .map(|v| DatabaseValue::String(v.format("%H:%M:%S%.f").to_string())),
        ref text if <String as FromSql>::accepts(text) => {
            row.try_get::<_, Option<String>>(idx)?.map(DatabaseValue::String)
        }
        ref other => row
            .try_get::<_, Option<RawValue>>(idx)?
            .map(|raw| raw_value(other, raw.0)),
    };
    Ok(value.unwrap_or(DatabaseValue::Null))
}

/// A column in its binary wire format, whatever its type
struct RawValue(Vec<u8>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        Ok(RawValue(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Render types without a dedicated mapping as text, or keep their bytes
fn raw_value(ty: &Type, raw: Vec<u8>) -> DatabaseValue {
    let text = match *ty {
        Type::NUMERIC => numeric_text(&raw),
        Type::UUID => uuid_text(&raw),
        Type::JSONB => match raw.split_first() {
            Some((1, json)) => String::from_utf8(json.to_vec()).ok(),
            _ => None,
        },
        Type::JSON | Type::XML | Type::CHAR => String::from_utf8(raw.clone()).ok(),
        _ if matches!(ty.kind(), Kind::Enum(_)) => String::from_utf8(raw.clone()).ok(),
        _ => None,
    };
    match text {
        Some(text) => DatabaseValue::String(text),
        None => DatabaseValue::Bytes(raw),
    }
}

/// Decimal text of a binary `numeric`: a header of four i16 words, then base-10000 digits
fn numeric_text(raw: &[u8]) -> Option<String> {
    let word = |i: usize| -> Option<i16> {
        let bytes = raw.get(i * 2..i * 2 + 2)?;
        Some(i16::from_be_bytes([bytes[0], bytes[1]]))
    };
    let ndigits = usize::try_from(word(0)?).ok()?;
    let weight = i32::from(word(1)?);
    let sign = word(2)? as u16;
    let dscale = usize::try_from(word(3)?).ok()?;

    match sign {
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => {}
    }

    let digit = |position: i32| -> Option<i16> {
        match usize::try_from(position) {
            Ok(position) if position < ndigits => word(4 + position),
            _ => Some(0),
        }
    };

    let mut text = String::new();
    if sign == 0x4000 {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit(0)?.to_string());
        for position in 1..=weight {
            text.push_str(&format!("{:04}", digit(position)?));
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut position = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(position)?));
            position += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    Some(text)
}

fn uuid_text(raw: &[u8]) -> Option<String> {
    if raw.len() != 16 {
        return None;
    }
    let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
    Some(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

type BoxError = Box<dyn Error + Sync + Send>;

fn integer_to_sql(value: i64, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(value)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(value)?.to_sql(ty, out),
        _ => value.to_sql(ty, out),
    }
}

impl ToSql for DatabaseValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self {
            DatabaseValue::Null => Ok(IsNull::Yes),
            DatabaseValue::Bool(v) => v.to_sql(ty, out),
            DatabaseValue::Int(v) => integer_to_sql(i64::from(*v), ty, out),
            DatabaseValue::Long(v) => integer_to_sql(*v, ty, out),
            DatabaseValue::Float(v) if *ty == Type::FLOAT8 => f64::from(*v).to_sql(ty, out),
            DatabaseValue::Float(v) => v.to_sql(ty, out),
            DatabaseValue::Double(v) if *ty == Type::FLOAT4 => (*v as f32).to_sql(ty, out),
            DatabaseValue::Double(v) => v.to_sql(ty, out),
            DatabaseValue::String(v) => v.to_sql(ty, out),
            DatabaseValue::Bytes(v) => v.to_sql(ty, out),
            DatabaseValue::Timestamp(_) => {
                let timestamp = self
                    .as_datetime()
                    .ok_or_else(|| format!("timestamp out of range: {:?}", self))?;
                if *ty == Type::TIMESTAMP {
                    timestamp.naive_utc().to_sql(ty, out)
                } else {
                    timestamp.to_sql(ty, out)
                }
            }
        }
    }

    // Each arm delegates to a typed encoder that reports its own mismatch
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
