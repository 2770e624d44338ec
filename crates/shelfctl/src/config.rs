//! Environment configuration

use crate::error::{Result, ShelfctlError};
use shelf_db::StoreOptions;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DOC_DB: &str = "shelf-docs.db";
pub const DEFAULT_BLOB_DB: &str = "shelf-blobs.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub doc_db: PathBuf,
    pub blob_db: PathBuf,
    pub store: StoreOptions,
}

impl Config {
    /// Read `SHELF_DOC_DB`, `SHELF_BLOB_DB`, `SHELF_BUSY_TIMEOUT_SECS` and
    /// `SHELF_MAX_CONNECTIONS`, falling back to defaults for unset variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let doc_db = lookup("SHELF_DOC_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOC_DB));
        let blob_db = lookup("SHELF_BLOB_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BLOB_DB));

        let mut store = StoreOptions::default();
        if let Some(secs) = lookup("SHELF_BUSY_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                ShelfctlError::Config(format!("SHELF_BUSY_TIMEOUT_SECS must be a number, got {:?}", secs))
            })?;
            store = store.with_busy_timeout(Duration::from_secs(secs));
        }
        if let Some(max) = lookup("SHELF_MAX_CONNECTIONS") {
            let max: u32 = max.parse().map_err(|_| {
                ShelfctlError::Config(format!("SHELF_MAX_CONNECTIONS must be a number, got {:?}", max))
            })?;
            store = store.with_max_connections(max);
        }

        Ok(Self {
            doc_db,
            blob_db,
            store,
        })
    }

    /// Apply command-line overrides on top of the environment
    pub fn with_overrides(
        mut self,
        doc_db: Option<PathBuf>,
        blob_db: Option<PathBuf>,
        busy_timeout_secs: Option<u64>,
    ) -> Self {
        if let Some(path) = doc_db {
            self.doc_db = path;
        }
        if let Some(path) = blob_db {
            self.blob_db = path;
        }
        if let Some(secs) = busy_timeout_secs {
            self.store = self.store.with_busy_timeout(Duration::from_secs(secs));
        }
        self
    }
}
