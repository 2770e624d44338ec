//! On-disk layout shared by the document and blob stores.
//!
//! One `document_data` table per file. Column names, types and index names
//! are a compatibility surface: files created by older builds must open
//! without migration.

pub const TABLE: &str = "document_data";

pub const DATA_COLUMN: &str = "data";

/// Schema for JSON documents (`data` holds UTF-8 text)
pub const DOCUMENT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS document_data
(
    doc_id INTEGER PRIMARY KEY,
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    last_modified INTEGER NOT NULL,
    created INTEGER NOT NULL,
    version INTEGER NOT NULL,
    data TEXT NOT NULL,
    UNIQUE(namespace, key)
);
CREATE INDEX IF NOT EXISTS index_namespace_key ON document_data (namespace, key);
CREATE INDEX IF NOT EXISTS index_key ON document_data (key);
CREATE INDEX IF NOT EXISTS index_namespace ON document_data (namespace);
"#;

/// Schema for binary payloads
pub const BLOB_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS document_data
(
    doc_id INTEGER PRIMARY KEY,
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    last_modified INTEGER NOT NULL,
    created INTEGER NOT NULL,
    version INTEGER NOT NULL,
    data BLOB NOT NULL,
    UNIQUE(namespace, key)
);
CREATE INDEX IF NOT EXISTS index_namespace_key ON document_data (namespace, key);
CREATE INDEX IF NOT EXISTS index_key ON document_data (key);
CREATE INDEX IF NOT EXISTS index_namespace ON document_data (namespace);
"#;

pub const MAX_DOC_ID: &str = "SELECT MAX(doc_id) FROM document_data";

/// Columns for metadata listings, in the order `MetaRow` reads them.
/// The cast makes `length` count bytes rather than characters.
pub const META_COLUMNS: &str =
    "doc_id, namespace, key, last_modified, created, version, length(CAST(data AS BLOB)) AS length";

/// As [`META_COLUMNS`] for a `BLOB` payload, whose size SQLite reads from the record header
pub const BLOB_META_COLUMNS: &str =
    "doc_id, namespace, key, last_modified, created, version, length(data) AS length";

/// Upsert shared by both stores. Binds: `?1` doc_id candidate, `?2` namespace,
/// `?3` key, `?4` now (ticks), `?5` payload. The candidate doc_id is only used
/// on first insert; an overwrite keeps the existing id and `created`.
/// `last_modified` is bumped by at least one tick so it strictly increases per key.
macro_rules! upsert_sql {
    ($payload:literal) => {
        concat!(
            "INSERT INTO document_data (doc_id, namespace, key, last_modified, created, version, data) ",
            "VALUES (?1, ?2, ?3, ?4, ?4, 1, ", $payload, ") ",
            "ON CONFLICT (namespace, key) DO UPDATE SET ",
            "last_modified = MAX(excluded.last_modified, document_data.last_modified + 1), ",
            "version = document_data.version + 1, ",
            "data = excluded.data ",
            "RETURNING doc_id, last_modified, created, version"
        )
    };
}

pub const UPSERT: &str = upsert_sql!("?5");

/// Reserves a zero-filled payload of `?5` bytes for incremental writing
pub const UPSERT_ZEROBLOB: &str = upsert_sql!("zeroblob(?5)");

pub fn checkpoint_sql(force: bool) -> &'static str {
    if force {
        "PRAGMA wal_checkpoint(TRUNCATE)"
    } else {
        "PRAGMA wal_checkpoint(PASSIVE)"
    }
}

pub const VACUUM: &str = "VACUUM";
