//! Error types for sensorhub-store.

use std::path::PathBuf;

/// Result type for sensorhub-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sensorhub-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A write violated a uniqueness constraint.
    #[error("Conflict on {table}.{field}")]
    Conflict { table: String, field: String },

    /// A referenced row does not exist.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
}

impl Error {
    /// Translate a failed write, turning UNIQUE violations into [`Error::Conflict`].
    ///
    /// SQLite reports these as `UNIQUE constraint failed: <table>.<column>`.
    pub(crate) fn from_write(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, Some(message)) = &err
            && code.code == rusqlite::ErrorCode::ConstraintViolation
            && let Some(columns) = message.strip_prefix("UNIQUE constraint failed: ")
        {
            let first = columns.split(',').next().unwrap_or(columns).trim();
            let (table, field) = first.split_once('.').unwrap_or(("", first));
            return Error::Conflict {
                table: table.to_string(),
                field: field.to_string(),
            };
        }
        Error::Database(err)
    }

    /// Whether this error is a uniqueness conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}
