//! Error types for shelf storage

use std::fmt;

/// Errors surfaced by the document and blob stores.
///
/// A missing entry is not an error: reads return `Ok(None)`.
#[derive(Debug)]
pub enum StoreError {
    /// A uniqueness or check constraint fired. Upserts make this unreachable
    /// for `(namespace, key)`, so seeing it means the file was edited externally.
    ConstraintViolation(String),
    /// A stored row could not be turned back into an entry
    Decode(String),
    /// The blob source ended before the declared length was copied
    StreamLengthMismatch { expected: u64, actual: u64 },
    /// Error from the pooled document engine
    Engine(Box<sqlx::Error>),
    /// Error from a blob store connection
    Sqlite(Box<rusqlite::Error>),
    Io(Box<std::io::Error>),
    Cancelled,
    /// A blocking storage worker panicked or was aborted
    Task(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ConstraintViolation(msg) => write!(f, "Constraint violation: {}", msg),
            StoreError::Decode(msg) => write!(f, "Decode error: {}", msg),
            StoreError::StreamLengthMismatch { expected, actual } => write!(
                f,
                "Stream length mismatch: declared {} bytes, source ended after {}",
                expected, actual
            ),
            StoreError::Engine(err) => write!(f, "Database error: {}", err),
            StoreError::Sqlite(err) => write!(f, "SQLite error: {}", err),
            StoreError::Io(err) => write!(f, "IO error: {}", err),
            StoreError::Cancelled => write!(f, "Operation cancelled"),
            StoreError::Task(msg) => write!(f, "Storage worker failed: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Engine(err) => Some(err.as_ref()),
            StoreError::Sqlite(err) => Some(err.as_ref()),
            StoreError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() || db_err.is_check_violation() {
                return StoreError::ConstraintViolation(db_err.message().to_string());
            }
        }
        StoreError::Engine(Box::new(err))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, msg) = &err {
            if code.code == rusqlite::ErrorCode::ConstraintViolation {
                return StoreError::ConstraintViolation(
                    msg.clone().unwrap_or_else(|| code.to_string()),
                );
            }
        }
        StoreError::Sqlite(Box::new(err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(Box::new(err))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
