//! Database type definitions
//!
//! This module defines the kinds of databases a connection can report.

use super::isolation::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported database types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[derive(Default)]
pub enum DatabaseType {
    /// No database type specified (test doubles, custom drivers)
    #[default]
    None = 0,
    /// PostgreSQL database
    Postgres = 1,
    /// SQLite database
    Sqlite = 3,
}

impl DatabaseType {
    /// Convert database type to string representation
    pub fn to_str(&self) -> &'static str {
        match self {
            DatabaseType::None => "none",
            DatabaseType::Postgres => "postgres",
            DatabaseType::Sqlite => "sqlite",
        }
    }

    /// Whether the engine natively distinguishes the given isolation level
    ///
    /// Levels that are not distinguished still work; the engine runs them at a
    /// stricter level.
    pub fn distinguishes(&self, level: IsolationLevel) -> bool {
        match self {
            DatabaseType::Sqlite => matches!(
                level,
                IsolationLevel::ReadUncommitted | IsolationLevel::Serializable
            ),
            DatabaseType::Postgres => level != IsolationLevel::ReadUncommitted,
            DatabaseType::None => true,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl FromStr for DatabaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(DatabaseType::None),
            "postgres" | "postgresql" => Ok(DatabaseType::Postgres),
            "sqlite" | "sqlite3" => Ok(DatabaseType::Sqlite),
            _ => Err(format!("Invalid database type: '{}'", s)),
        }
    }
}
