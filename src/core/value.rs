//! Database value types
//!
//! This module defines the values exchanged with drivers, the ordered row mapping
//! produced by the reader shaper, and the coercion rules used by the scalar shaper.

use super::error::{DatabaseError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// Database value that can hold different types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatabaseValue {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit floating point
    Float(f32),
    /// 64-bit floating point
    Double(f64),
    /// String value
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Timestamp (Unix timestamp in microseconds, UTC)
    Timestamp(i64),
}

impl DatabaseValue {
    /// Get the value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DatabaseValue::Bool(v) => Some(*v),
            DatabaseValue::Int(v) => Some(*v != 0),
            DatabaseValue::Long(v) => Some(*v != 0),
            DatabaseValue::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Get the value as an i64 without losing precision
    ///
    /// Floating point values are accepted only when they hold an integral number
    /// that fits in an i64.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            DatabaseValue::Long(v) => Some(*v),
            DatabaseValue::Int(v) => Some(*v as i64),
            DatabaseValue::Bool(v) => Some(*v as i64),
            DatabaseValue::Float(v) => integral_f64(*v as f64),
            DatabaseValue::Double(v) => integral_f64(*v),
            DatabaseValue::String(s) => s.trim().parse().ok(),
            DatabaseValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as an i32, failing on overflow
    pub fn as_int(&self) -> Option<i32> {
        self.as_long().and_then(|v| i32::try_from(v).ok())
    }

    /// Get the value as an f64
    pub fn as_double(&self) -> Option<f64> {
        match self {
            DatabaseValue::Double(v) => Some(*v),
            DatabaseValue::Float(v) => Some(*v as f64),
            DatabaseValue::Int(v) => Some(*v as f64),
            DatabaseValue::Long(v) => Some(*v as f64),
            DatabaseValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            DatabaseValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Get the value as a string (zero-copy for String values)
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get the value as a string (with conversion)
    pub fn as_string(&self) -> String {
        match self {
            DatabaseValue::Null => "null".to_string(),
            DatabaseValue::Bool(v) => v.to_string(),
            DatabaseValue::Int(v) => v.to_string(),
            DatabaseValue::Long(v) => v.to_string(),
            DatabaseValue::Float(v) => v.to_string(),
            DatabaseValue::Double(v) => v.to_string(),
            DatabaseValue::String(s) => s.clone(),
            DatabaseValue::Bytes(b) => format!("<{} bytes>", b.len()),
            DatabaseValue::Timestamp(v) => match DateTime::from_timestamp_micros(*v) {
                Some(dt) => dt.to_rfc3339(),
                None => v.to_string(),
            },
        }
    }

    /// Get the value as bytes (zero-copy)
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DatabaseValue::Bytes(b) => Some(b),
            DatabaseValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Get the value as a UTC date-time
    ///
    /// Accepts timestamps and text in RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` or
    /// `YYYY-MM-DD` form; naive text is read as UTC.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            DatabaseValue::Timestamp(v) => DateTime::from_timestamp_micros(*v),
            DatabaseValue::String(s) => parse_datetime(s.trim()),
            _ => None,
        }
    }

    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            DatabaseValue::Null => "null",
            DatabaseValue::Bool(_) => "bool",
            DatabaseValue::Int(_) => "int",
            DatabaseValue::Long(_) => "long",
            DatabaseValue::Float(_) => "float",
            DatabaseValue::Double(_) => "double",
            DatabaseValue::String(_) => "string",
            DatabaseValue::Bytes(_) => "bytes",
            DatabaseValue::Timestamp(_) => "timestamp",
        }
    }
}

fn integral_f64(v: f64) -> Option<i64> {
    if v.is_finite() && v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl From<bool> for DatabaseValue {
    fn from(v: bool) -> Self {
        DatabaseValue::Bool(v)
    }
}

impl From<i32> for DatabaseValue {
    fn from(v: i32) -> Self {
        DatabaseValue::Int(v)
    }
}

impl From<i64> for DatabaseValue {
    fn from(v: i64) -> Self {
        DatabaseValue::Long(v)
    }
}

impl From<f32> for DatabaseValue {
    fn from(v: f32) -> Self {
        DatabaseValue::Float(v)
    }
}

impl From<f64> for DatabaseValue {
    fn from(v: f64) -> Self {
        DatabaseValue::Double(v)
    }
}

impl From<String> for DatabaseValue {
    fn from(v: String) -> Self {
        DatabaseValue::String(v)
    }
}

impl From<&str> for DatabaseValue {
    fn from(v: &str) -> Self {
        DatabaseValue::String(v.to_string())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(v: Vec<u8>) -> Self {
        DatabaseValue::Bytes(v)
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(v: DateTime<Utc>) -> Self {
        DatabaseValue::Timestamp(v.timestamp_micros())
    }
}

impl From<NaiveDateTime> for DatabaseValue {
    fn from(v: NaiveDateTime) -> Self {
        DatabaseValue::Timestamp(v.and_utc().timestamp_micros())
    }
}

impl<T: Into<DatabaseValue>> From<Option<T>> for DatabaseValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// Conversion from a raw driver value into a Rust type
///
/// Used by the scalar shaper and [`DatabaseRow::get_as`]. Implementations must reject
/// values that cannot be represented without loss with [`DatabaseError::TypeMismatch`].
pub trait FromDatabaseValue: Sized {
    /// Convert a non-null value
    fn from_database_value(value: &DatabaseValue) -> Result<Self>;
}

fn coerce<T>(value: &DatabaseValue, expected: &str, converted: Option<T>) -> Result<T> {
    converted.ok_or_else(|| DatabaseError::type_mismatch(expected, value.type_name()))
}

impl FromDatabaseValue for DatabaseValue {
    fn from_database_value(value: &DatabaseValue) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromDatabaseValue for bool {
    fn from_database_value(value: &DatabaseValue) -> Result<Self> {
        coerce(value, "bool", value.as_bool())
    }
}

impl FromDatabaseValue for i32 {
    fn from_database_value(value: &DatabaseValue) -> Result<Self> {
        coerce(value, "i32", value.as_int())
    }
}

impl FromDatabaseValue for i64 {
    fn from_database_value(value: &DatabaseValue) -> Result<Self> {
        coerce(value, "i64", value.as_long())
    }
}

impl FromDatabaseValue for u64 {
    fn from_database_value(value: &DatabaseValue) -> Result<Self> {
        coerce(
            value,
            "u64",
            value.as_long().and_then(|v| u64::try_from(v).ok()),
        )
    }
}

impl FromDatabaseValue for f32 {
    fn from_database_value(value: &DatabaseValue) -> Result<Self> {
        let converted = match value {
            DatabaseValue::Float(v) => Some(*v),
            _ => value
                .as_double()
                .filter(|v| !v.is_finite() || v.abs() <= f32::MAX as f64)
                .map(|v| v as f32),
        };
        coerce(value, "f32", converted)
    }
}

impl FromDatabaseValue for f64 {
    fn from_database_value(value: &DatabaseValue) -> Result<Self> {
        coerce(value, "f64", value.as_double())
    }
}

impl FromDatabaseValue for String {
    fn from_database_value(value: &DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::Bytes(b) => coerce(value, "string", String::from_utf8(b.clone()).ok()),
            DatabaseValue::Null => Err(DatabaseError::type_mismatch("string", "null")),
            other => Ok(other.as_string()),
        }
    }
}

impl FromDatabaseValue for Vec<u8> {
    fn from_database_value(value: &DatabaseValue) -> Result<Self> {
        coerce(value, "bytes", value.as_bytes().map(<[u8]>::to_vec))
    }
}

impl FromDatabaseValue for DateTime<Utc> {
    fn from_database_value(value: &DatabaseValue) -> Result<Self> {
        coerce(value, "datetime", value.as_datetime())
    }
}

impl FromDatabaseValue for NaiveDateTime {
    fn from_database_value(value: &DatabaseValue) -> Result<Self> {
        coerce(
            value,
            "datetime",
            value.as_datetime().map(|dt| dt.naive_utc()),
        )
    }
}

impl<T: FromDatabaseValue> FromDatabaseValue for Option<T> {
    fn from_database_value(value: &DatabaseValue) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_database_value(value).map(Some)
        }
    }
}

/// A row of database results
///
/// Columns keep the order the driver reported them in. Inserting a name that is
/// already present replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseRow {
    columns: Vec<(String, DatabaseValue)>,
}

impl DatabaseRow {
    /// Create an empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty row with room for `capacity` columns
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: Vec::with_capacity(capacity),
        }
    }

    /// Set a column value, returning the previous value for that name
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: DatabaseValue,
    ) -> Option<DatabaseValue> {
        let name = name.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.columns.push((name, value));
                None
            }
        }
    }

    /// Look up a column by name
    pub fn get(&self, name: &str) -> Option<&DatabaseValue> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Look up a column and coerce it; null yields the type's default
    pub fn get_as<T: FromDatabaseValue + Default>(&self, name: &str) -> Result<T> {
        let value = self
            .get(name)
            .ok_or_else(|| DatabaseError::ColumnNotFound(name.to_string()))?;
        if value.is_null() {
            return Ok(T::default());
        }
        T::from_database_value(value)
    }

    /// Check whether a column is present
    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Column names in driver order
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Iterate over (name, value) pairs in driver order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DatabaseValue)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl IntoIterator for DatabaseRow {
    type Item = (String, DatabaseValue);
    type IntoIter = std::vec::IntoIter<(String, DatabaseValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.into_iter()
    }
}

impl<K: Into<String>> FromIterator<(K, DatabaseValue)> for DatabaseRow {
    fn from_iter<I: IntoIterator<Item = (K, DatabaseValue)>>(iter: I) -> Self {
        let mut row = DatabaseRow::new();
        for (name, value) in iter {
            row.insert(name, value);
        }
        row
    }
}

impl Serialize for DatabaseRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Multiple rows returned from a query
pub type DatabaseResult = Vec<DatabaseRow>;
