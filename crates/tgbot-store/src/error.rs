//! Error types for the tgbot-store crate.
//!
//! All component operations return [`StoreError`] via [`StoreResult`].
//! The [`Store`](crate::Store) facade is the only place that turns these
//! into safe defaults.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem operation failed (snapshots, restore, directories).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A value could not be serialized or compressed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A schema change on a table failed.
    #[error("migration of {table} failed: {message}")]
    Migration { table: &'static str, message: String },

    /// A property name that is not a column of the `users` table.
    #[error("unknown user property: {0}")]
    UnknownProperty(String),

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    /// The configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
