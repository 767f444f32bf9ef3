//! Database drivers
//!
//! SQLite is driven through the blocking adapter; PostgreSQL implements the async
//! contract directly.

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteCommand, SqliteConnection, SqliteCursor, SqliteTransaction};

#[cfg(feature = "postgres")]
pub use postgres::PostgresConnection;
