//! Error types for shelfctl

use shelf_db::StoreError;
use std::fmt;

#[derive(Debug)]
pub enum ShelfctlError {
    Store(StoreError),
    Io(std::io::Error),
    Json(String),
    Config(String),
    NotFound { namespace: String, key: String },
    /// Bad command-line input that clap could not catch
    Usage(String),
}

impl fmt::Display for ShelfctlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShelfctlError::Store(err) => write!(f, "Storage error: {}", err),
            ShelfctlError::Io(err) => write!(f, "IO error: {}", err),
            ShelfctlError::Json(msg) => write!(f, "JSON error: {}", msg),
            ShelfctlError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ShelfctlError::NotFound { namespace, key } => {
                write!(f, "No entry {}/{}", namespace, key)
            }
            ShelfctlError::Usage(msg) => write!(f, "Usage error: {}", msg),
        }
    }
}

impl std::error::Error for ShelfctlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShelfctlError::Store(err) => Some(err),
            ShelfctlError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ShelfctlError {
    fn from(err: StoreError) -> Self {
        ShelfctlError::Store(err)
    }
}

impl From<std::io::Error> for ShelfctlError {
    fn from(err: std::io::Error) -> Self {
        ShelfctlError::Io(err)
    }
}

impl From<serde_json::Error> for ShelfctlError {
    fn from(err: serde_json::Error) -> Self {
        ShelfctlError::Json(err.to_string())
    }
}

impl From<tracing_subscriber::filter::ParseError> for ShelfctlError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ShelfctlError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ShelfctlError>;
