//! JSON document store on a pooled SQLite file

use crate::error::{Result, StoreError};
use crate::options::StoreOptions;
use crate::schema::{self, DOCUMENT_SCHEMA, MAX_DOC_ID, META_COLUMNS, TABLE, UPSERT};
use crate::storage::DocumentStorage;
use crate::stream::channel_stream;
use crate::ticks::{from_ticks, now_ticks, to_ticks};
use crate::types::{
    DocumentEntry, DocumentEntryMeta, DocumentRow, LikeExpr, ListFilter, MetaRow, NamespaceFilter,
};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DOCUMENT_COLUMNS: &str = "doc_id, namespace, key, last_modified, created, version, data";

/// Namespaced, versioned JSON documents in a single SQLite file.
///
/// Clones share the pool and the doc_id counter.
#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
    counter: Arc<AtomicU64>,
    path: PathBuf,
}

impl DocumentStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreOptions::default()).await
    }

    pub async fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening document store: {}", path.display());

        let connect = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(options.busy_timeout)
            .pragma("case_sensitive_like", "true");

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect)
            .await?;

        sqlx::raw_sql(DOCUMENT_SCHEMA).execute(&pool).await?;

        let max_id: Option<i64> = sqlx::query_scalar(MAX_DOC_ID).fetch_one(&pool).await?;
        let last_id = max_id.unwrap_or(0).max(0) as u64;
        info!(path = %path.display(), last_id, "Document store ready");

        Ok(Self {
            pool,
            counter: Arc::new(AtomicU64::new(last_id)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release all pooled connections. Further calls fail with a pool error.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Closed document store: {}", self.path.display());
    }

    fn next_doc_id(&self) -> i64 {
        (self.counter.fetch_add(1, Ordering::SeqCst) + 1) as i64
    }

    pub async fn write(&self, namespace: &str, key: &str, value: &Value) -> Result<DocumentEntry> {
        let data = serde_json::to_string(value)?;
        let (doc_id, last_modified, created, version): (i64, i64, i64, i64) =
            sqlx::query_as(UPSERT)
                .bind(self.next_doc_id())
                .bind(namespace)
                .bind(key)
                .bind(now_ticks())
                .bind(&data)
                .fetch_one(&self.pool)
                .await?;
        debug!("Wrote document {}/{} (version {})", namespace, key, version);

        Ok(DocumentEntry {
            doc_id: doc_id as u64,
            namespace: namespace.to_string(),
            key: key.to_string(),
            last_modified: from_ticks(last_modified)?,
            created: from_ticks(created)?,
            version: version as u64,
            data: value.clone(),
        })
    }

    pub async fn read(&self, namespace: &str, key: &str) -> Result<Option<DocumentEntry>> {
        let row: Option<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE namespace = ?1 AND key = ?2",
            DOCUMENT_COLUMNS,
            TABLE
        ))
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DocumentEntry::<Value>::try_from).transpose()
    }

    pub async fn delete(
        &self,
        namespace: &str,
        key: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {} WHERE namespace = ", TABLE));
        qb.push_bind(namespace);
        if let Some(key) = key {
            qb.push(" AND key = ");
            qb.push_bind(key);
        }
        push_range(&mut qb, from, to);

        let removed = qb.build().execute(&self.pool).await?.rows_affected();
        debug!("Deleted {} document(s) from {}", removed, namespace);
        Ok(removed)
    }

    /// Stream documents in `namespace`. Rows are fetched as the stream is
    /// polled; dropping it early releases the cursor.
    pub fn list(&self, namespace: &str, filter: ListFilter) -> BoxStream<'static, Result<DocumentEntry>> {
        let pool = self.pool.clone();
        let namespace = namespace.to_string();
        channel_stream(move |tx| async move {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {} FROM {} WHERE namespace = ",
                DOCUMENT_COLUMNS, TABLE
            ));
            qb.push_bind(namespace);
            push_filter(&mut qb, &filter);
            qb.push(" ORDER BY doc_id");

            let mut rows = qb.build().fetch(&pool);
            while let Some(row) = rows.next().await {
                let item = row
                    .and_then(|r| DocumentRow::from_row(&r))
                    .map_err(StoreError::from)
                    .and_then(DocumentEntry::<Value>::try_from);
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        })
    }

    pub fn list_meta(
        &self,
        namespace: NamespaceFilter,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<DocumentEntryMeta>> {
        let pool = self.pool.clone();
        channel_stream(move |tx| async move {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {} FROM {} WHERE 1 = 1",
                META_COLUMNS, TABLE
            ));
            push_namespace(&mut qb, namespace);
            push_filter(&mut qb, &filter);
            qb.push(" ORDER BY doc_id");

            let mut rows = qb.build().fetch(&pool);
            while let Some(row) = rows.next().await {
                let item = row
                    .and_then(|r| MetaRow::from_row(&r))
                    .map_err(StoreError::from)
                    .and_then(DocumentEntryMeta::try_from);
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        })
    }

    pub async fn count(&self, namespace: Option<&str>, key_pattern: Option<&LikeExpr>) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {} WHERE 1 = 1", TABLE));
        if let Some(namespace) = namespace {
            qb.push(" AND namespace = ");
            qb.push_bind(namespace);
        }
        if let Some(pattern) = key_pattern {
            qb.push(" AND key LIKE ");
            qb.push_bind(pattern.pattern());
        }
        let count: i64 = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    pub async fn flush(&self, force: bool) -> Result<()> {
        let (busy, log, checkpointed): (i64, i64, i64) =
            sqlx::query_as(schema::checkpoint_sql(force))
                .fetch_one(&self.pool)
                .await?;
        if busy != 0 {
            warn!(
                busy,
                log, checkpointed, "WAL checkpoint could not complete while readers were active"
            );
        } else {
            debug!("Checkpointed {} of {} WAL frames", checkpointed, log);
        }
        Ok(())
    }

    pub async fn compact(&self) {
        if let Err(e) = sqlx::query(schema::VACUUM).execute(&self.pool).await {
            warn!(path = %self.path.display(), error = %e, "Compaction failed");
        }
    }
}

fn push_range(
    qb: &mut QueryBuilder<'_, Sqlite>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) {
    if let Some(from) = from {
        qb.push(" AND last_modified >= ");
        qb.push_bind(to_ticks(from));
    }
    if let Some(to) = to {
        qb.push(" AND last_modified <= ");
        qb.push_bind(to_ticks(to));
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &ListFilter) {
    if let Some(pattern) = &filter.key_pattern {
        qb.push(" AND key LIKE ");
        qb.push_bind(pattern.pattern().to_string());
    }
    push_range(qb, filter.from, filter.to);
}

fn push_namespace(qb: &mut QueryBuilder<'_, Sqlite>, namespace: NamespaceFilter) {
    match namespace {
        NamespaceFilter::All => {}
        NamespaceFilter::Exact(ns) => {
            qb.push(" AND namespace = ");
            qb.push_bind(ns);
        }
        NamespaceFilter::Like(pattern) => {
            qb.push(" AND namespace LIKE ");
            qb.push_bind(pattern.pattern().to_string());
        }
    }
}

impl DocumentStorage for DocumentStore {
    async fn write(&self, namespace: &str, key: &str, value: &Value) -> Result<DocumentEntry> {
        DocumentStore::write(self, namespace, key, value).await
    }

    async fn read(&self, namespace: &str, key: &str) -> Result<Option<DocumentEntry>> {
        DocumentStore::read(self, namespace, key).await
    }

    async fn delete(
        &self,
        namespace: &str,
        key: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        DocumentStore::delete(self, namespace, key, from, to).await
    }

    fn list(&self, namespace: &str, filter: ListFilter) -> BoxStream<'static, Result<DocumentEntry>> {
        DocumentStore::list(self, namespace, filter)
    }

    fn list_meta(
        &self,
        namespace: NamespaceFilter,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<DocumentEntryMeta>> {
        DocumentStore::list_meta(self, namespace, filter)
    }

    async fn count(&self, namespace: Option<&str>, key_pattern: Option<&LikeExpr>) -> Result<u64> {
        DocumentStore::count(self, namespace, key_pattern).await
    }

    async fn flush(&self, force: bool) -> Result<()> {
        DocumentStore::flush(self, force).await
    }

    async fn compact(&self) {
        DocumentStore::compact(self).await
    }
}
