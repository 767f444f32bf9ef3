//! Command requests
//!
//! A [`CommandRequest`] carries everything the transactional runner needs for one call:
//! the command text, the isolation level, the parameters to bind, and an optional
//! cancellation signal.

use super::error::{DatabaseError, Result};
use super::isolation::IsolationLevel;
use super::parameter::{Parameter, ParameterType};
use super::value::DatabaseValue;
use tokio_util::sync::CancellationToken;

/// A single command invocation
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    text: Option<String>,
    isolation_level: IsolationLevel,
    parameters: Vec<Parameter>,
    cancellation: Option<CancellationToken>,
}

impl CommandRequest {
    /// Create a request for the given command text
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Create a request whose text may be absent
    ///
    /// An absent text is rejected by every entry point before any I/O.
    pub fn from_optional(text: Option<String>) -> Self {
        Self {
            text,
            ..Default::default()
        }
    }

    /// Set the isolation level
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Append a parameter
    pub fn param(mut self, name: impl Into<String>, value: impl Into<DatabaseValue>) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }

    /// Append a parameter with a declared type
    pub fn typed_param(
        mut self,
        name: impl Into<String>,
        value: impl Into<DatabaseValue>,
        type_hint: ParameterType,
    ) -> Self {
        self.parameters
            .push(Parameter::typed(name, value, type_hint));
        self
    }

    /// Append several parameters, keeping their order
    pub fn params<I, P>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Parameter>,
    {
        self.parameters
            .extend(parameters.into_iter().map(Into::into));
        self
    }

    /// Attach a cancellation signal
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// The command text, if present
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// The requested isolation level
    pub fn level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// Parameters in binding order
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// The cancellation signal, if any
    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Check the request's preconditions and return the command text
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::InvalidArgument`] if the text is absent or blank
    pub fn validate(&self) -> Result<&str> {
        match self.text.as_deref() {
            None => Err(DatabaseError::invalid_argument("command text is required")),
            Some(text) if text.trim().is_empty() => Err(DatabaseError::invalid_argument(
                "command text must not be empty",
            )),
            Some(text) => Ok(text),
        }
    }
}

impl From<&str> for CommandRequest {
    fn from(text: &str) -> Self {
        CommandRequest::new(text)
    }
}

impl From<String> for CommandRequest {
    fn from(text: String) -> Self {
        CommandRequest::new(text)
    }
}
