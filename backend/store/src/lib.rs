//! Durable session storage backed by SQLite.

mod schema;
mod sqlite;

pub use sqlite::SqliteStore;
