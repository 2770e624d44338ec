pub mod blob;
pub mod document;
pub mod error;
pub mod namespace;
pub mod options;
pub mod retention;
pub mod schema;
pub mod storage;
mod stream;
pub mod ticks;
pub mod types;

pub use blob::{BlobReader, BlobStore};
pub use document::DocumentStore;
pub use error::{Result, StoreError};
pub use namespace::SimpleDocument;
pub use options::StoreOptions;
pub use retention::{
    run_cycle, AgeRule, RetentionEngine, RetentionHandle, RetentionOptions, RetentionRule, RetentionState,
    RetentionStatus, RetentionTarget, TotalSizeRule,
};
pub use storage::{BlobStorage, DocumentStorage, DocumentStorageExt};
pub use tokio_util::sync::CancellationToken;
pub use types::*;
