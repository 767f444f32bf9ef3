//! Named command parameters

use super::error::{DatabaseError, Result};
use super::value::DatabaseValue;
use serde::{Deserialize, Serialize};

/// Declared type of a parameter, used to coerce its value before binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Bool,
    Int,
    Long,
    Float,
    Double,
    String,
    Bytes,
    Timestamp,
}

impl ParameterType {
    /// Coerce `value` to this type. Null passes through unchanged.
    pub fn coerce(&self, value: DatabaseValue) -> Result<DatabaseValue> {
        if value.is_null() {
            return Ok(value);
        }

        let converted = match self {
            ParameterType::Bool => value.as_bool().map(DatabaseValue::Bool),
            ParameterType::Int => value.as_int().map(DatabaseValue::Int),
            ParameterType::Long => value.as_long().map(DatabaseValue::Long),
            ParameterType::Float => value.as_double().map(|v| DatabaseValue::Float(v as f32)),
            ParameterType::Double => value.as_double().map(DatabaseValue::Double),
            ParameterType::String => match &value {
                DatabaseValue::Bytes(b) => String::from_utf8(b.clone())
                    .ok()
                    .map(DatabaseValue::String),
                other => Some(DatabaseValue::String(other.as_string())),
            },
            ParameterType::Bytes => value.as_bytes().map(|b| DatabaseValue::Bytes(b.to_vec())),
            ParameterType::Timestamp => value
                .as_datetime()
                .map(|dt| DatabaseValue::Timestamp(dt.timestamp_micros())),
        };

        converted.ok_or_else(|| DatabaseError::type_mismatch(self.to_str(), value.type_name()))
    }

    /// Convert parameter type to string representation
    pub fn to_str(&self) -> &'static str {
        match self {
            ParameterType::Bool => "bool",
            ParameterType::Int => "int",
            ParameterType::Long => "long",
            ParameterType::Float => "float",
            ParameterType::Double => "double",
            ParameterType::String => "string",
            ParameterType::Bytes => "bytes",
            ParameterType::Timestamp => "timestamp",
        }
    }
}

/// A named value bound to a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name, with or without a leading `:`, `@` or `$`
    pub name: String,
    /// Value to bind
    pub value: DatabaseValue,
    /// Optional declared type
    pub type_hint: Option<ParameterType>,
}

impl Parameter {
    /// Create an untyped parameter
    pub fn new(name: impl Into<String>, value: impl Into<DatabaseValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            type_hint: None,
        }
    }

    /// Create a parameter with a declared type
    pub fn typed(
        name: impl Into<String>,
        value: impl Into<DatabaseValue>,
        type_hint: ParameterType,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            type_hint: Some(type_hint),
        }
    }

    /// The name without its placeholder prefix
    pub fn bare_name(&self) -> &str {
        self.name.trim_start_matches([':', '@', '$'])
    }

    /// The value to hand to the driver, after applying the type hint
    pub fn resolved_value(&self) -> Result<DatabaseValue> {
        match self.type_hint {
            Some(hint) => hint.coerce(self.value.clone()),
            None => Ok(self.value.clone()),
        }
    }
}

impl<N: Into<String>, V: Into<DatabaseValue>> From<(N, V)> for Parameter {
    fn from((name, value): (N, V)) -> Self {
        Parameter::new(name, value)
    }
}
