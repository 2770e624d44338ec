//! Entry and query types shared by the document and blob stores

use crate::error::{Result, StoreError};
use crate::ticks::from_ticks;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// A stored document with its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntry<T = serde_json::Value> {
    pub doc_id: u64,
    pub namespace: String,
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub version: u64,
    pub data: T,
}

impl DocumentEntry<serde_json::Value> {
    /// Deserialize the payload into a concrete type
    pub fn decode<T: DeserializeOwned>(self) -> Result<DocumentEntry<T>> {
        let data = serde_json::from_value(self.data)?;
        Ok(DocumentEntry {
            doc_id: self.doc_id,
            namespace: self.namespace,
            key: self.key,
            last_modified: self.last_modified,
            created: self.created,
            version: self.version,
            data,
        })
    }
}

/// Document metadata without the payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentEntryMeta {
    pub doc_id: u64,
    pub namespace: String,
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub version: u64,
    /// Size of the stored payload in bytes
    pub length: u64,
}

/// Blob metadata; the payload itself is read through a stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobEntryMeta {
    pub doc_id: u64,
    pub namespace: String,
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub version: u64,
    pub raw_length: u64,
}

/// Common view over entry metadata, used by retention rules
pub trait EntryMeta: Clone + Eq + std::hash::Hash + Send + Sync + 'static {
    fn namespace(&self) -> &str;
    fn key(&self) -> &str;
    fn created(&self) -> DateTime<Utc>;
    fn last_modified(&self) -> DateTime<Utc>;
    /// Payload size in bytes
    fn size(&self) -> u64;
}

impl EntryMeta for DocumentEntryMeta {
    fn namespace(&self) -> &str {
        &self.namespace
    }
    fn key(&self) -> &str {
        &self.key
    }
    fn created(&self) -> DateTime<Utc> {
        self.created
    }
    fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }
    fn size(&self) -> u64 {
        self.length
    }
}

impl EntryMeta for BlobEntryMeta {
    fn namespace(&self) -> &str {
        &self.namespace
    }
    fn key(&self) -> &str {
        &self.key
    }
    fn created(&self) -> DateTime<Utc> {
        self.created
    }
    fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }
    fn size(&self) -> u64 {
        self.raw_length
    }
}

/// Case-sensitive SQL `LIKE` pattern: `%` matches any run, `_` a single char.
///
/// `LikeExpr::new("tel:123-456-%")` matches every key starting with `tel:123-456-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LikeExpr(String);

impl LikeExpr {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn pattern(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LikeExpr {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

impl From<String> for LikeExpr {
    fn from(pattern: String) -> Self {
        Self(pattern)
    }
}

impl fmt::Display for LikeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional key pattern and inclusive `last_modified` range for listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub key_pattern: Option<LikeExpr>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl ListFilter {
    pub fn keys(pattern: impl Into<LikeExpr>) -> Self {
        Self {
            key_pattern: Some(pattern.into()),
            ..Self::default()
        }
    }

    pub fn modified_between(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.from = from;
        self.to = to;
        self
    }
}

/// Namespace selection for metadata listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NamespaceFilter {
    #[default]
    All,
    Exact(String),
    Like(LikeExpr),
}

impl From<&str> for NamespaceFilter {
    fn from(namespace: &str) -> Self {
        NamespaceFilter::Exact(namespace.to_string())
    }
}

impl From<Option<&str>> for NamespaceFilter {
    fn from(namespace: Option<&str>) -> Self {
        namespace.map_or(NamespaceFilter::All, NamespaceFilter::from)
    }
}

/// Raw `document_data` row as read by the document store
#[derive(Debug, FromRow)]
pub(crate) struct DocumentRow {
    pub doc_id: i64,
    pub namespace: String,
    pub key: String,
    pub last_modified: i64,
    pub created: i64,
    pub version: i64,
    pub data: String,
}

impl TryFrom<DocumentRow> for DocumentEntry {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self> {
        let data = serde_json::from_str(&row.data).map_err(|e| {
            StoreError::Decode(format!(
                "document {}/{} (doc_id {}): {}",
                row.namespace, row.key, row.doc_id, e
            ))
        })?;
        Ok(Self {
            doc_id: row.doc_id as u64,
            namespace: row.namespace,
            key: row.key,
            last_modified: from_ticks(row.last_modified)?,
            created: from_ticks(row.created)?,
            version: row.version as u64,
            data,
        })
    }
}

/// Metadata row; `length` is the payload size in bytes
#[derive(Debug, FromRow)]
pub(crate) struct MetaRow {
    pub doc_id: i64,
    pub namespace: String,
    pub key: String,
    pub last_modified: i64,
    pub created: i64,
    pub version: i64,
    pub length: i64,
}

impl TryFrom<MetaRow> for DocumentEntryMeta {
    type Error = StoreError;

    fn try_from(row: MetaRow) -> Result<Self> {
        Ok(Self {
            doc_id: row.doc_id as u64,
            namespace: row.namespace,
            key: row.key,
            last_modified: from_ticks(row.last_modified)?,
            created: from_ticks(row.created)?,
            version: row.version as u64,
            length: row.length as u64,
        })
    }
}

impl TryFrom<MetaRow> for BlobEntryMeta {
    type Error = StoreError;

    fn try_from(row: MetaRow) -> Result<Self> {
        Ok(Self {
            doc_id: row.doc_id as u64,
            namespace: row.namespace,
            key: row.key,
            last_modified: from_ticks(row.last_modified)?,
            created: from_ticks(row.created)?,
            version: row.version as u64,
            raw_length: row.length as u64,
        })
    }
}

impl MetaRow {
    /// Read a row selected with [`crate::schema::META_COLUMNS`]
    pub(crate) fn from_sqlite(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            doc_id: row.get(0)?,
            namespace: row.get(1)?,
            key: row.get(2)?,
            last_modified: row.get(3)?,
            created: row.get(4)?,
            version: row.get(5)?,
            length: row.get(6)?,
        })
    }
}
