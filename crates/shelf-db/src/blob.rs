//! Binary payload store with incremental, chunked blob I/O.
//!
//! Writes go through one connection behind a store-wide async mutex: the row
//! is upserted with a zero-filled payload of the declared size, then the
//! source is copied into it chunk by chunk. That copy is not atomic with the
//! upsert, so a short source or a cancellation leaves a row whose content is
//! only partially written.
//!
//! Every read opens its own connection and transaction, so readers see a
//! stable snapshot and never wait on the writer gate.

use crate::error::{Result, StoreError};
use crate::options::StoreOptions;
use crate::schema::{
    checkpoint_sql, BLOB_META_COLUMNS, BLOB_SCHEMA, DATA_COLUMN, MAX_DOC_ID, TABLE,
    UPSERT_ZEROBLOB, VACUUM,
};
use crate::storage::BlobStorage;
use crate::stream::blocking_channel_stream;
use crate::ticks::{from_ticks, now_ticks, to_ticks};
use crate::types::{BlobEntryMeta, LikeExpr, ListFilter, MetaRow, NamespaceFilter};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, DatabaseName, OpenFlags, OptionalExtension};
use std::fmt::Write as _;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bytes copied per incremental write
pub const CHUNK_SIZE: usize = 80 * 1024;

/// Reader connection shared by every payload handed out from one snapshot
type SharedConn = Arc<StdMutex<Connection>>;

/// Namespaced, versioned binary payloads in a single SQLite file.
///
/// Clones share the writer connection, its gate and the doc_id counter.
#[derive(Clone)]
pub struct BlobStore {
    path: PathBuf,
    options: StoreOptions,
    writer: Arc<Mutex<Connection>>,
    counter: Arc<AtomicU64>,
}

fn configure(conn: &Connection, options: &StoreOptions) -> Result<()> {
    conn.busy_timeout(options.busy_timeout)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "case_sensitive_like", true)?;
    Ok(())
}

fn open_reader(path: &Path, options: &StoreOptions) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI,
    )?;
    configure(&conn, options)?;
    Ok(conn)
}

impl BlobStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreOptions::default()).await
    }

    pub async fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening blob store: {}", path.display());

        let (conn, last_id) = {
            let path = path.clone();
            let options = options.clone();
            tokio::task::spawn_blocking(move || -> Result<(Connection, u64)> {
                let conn = Connection::open(&path)?;
                let mode: String =
                    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                if !mode.eq_ignore_ascii_case("wal") {
                    warn!(path = %path.display(), mode = %mode, "WAL journaling unavailable");
                }
                configure(&conn, &options)?;
                conn.execute_batch(BLOB_SCHEMA)?;
                let max_id: Option<i64> = conn.query_row(MAX_DOC_ID, [], |row| row.get(0))?;
                Ok((conn, max_id.unwrap_or(0).max(0) as u64))
            })
            .await??
        };
        info!(path = %path.display(), last_id, "Blob store ready");

        Ok(Self {
            path,
            options,
            writer: Arc::new(Mutex::new(conn)),
            counter: Arc::new(AtomicU64::new(last_id)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy exactly `declared_len` bytes from `source` into `(namespace, key)`
    pub async fn write<R>(
        &self,
        namespace: &str,
        key: &str,
        source: R,
        declared_len: u64,
        cancel: CancellationToken,
    ) -> Result<BlobEntryMeta>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.write_from(namespace, key, SyncIoBridge::new(source), declared_len, cancel)
            .await
    }

    pub async fn write_bytes(&self, namespace: &str, key: &str, data: &[u8]) -> Result<BlobEntryMeta> {
        let len = data.len() as u64;
        self.write_from(
            namespace,
            key,
            io::Cursor::new(data.to_vec()),
            len,
            CancellationToken::new(),
        )
        .await
    }

    async fn write_from<R>(
        &self,
        namespace: &str,
        key: &str,
        mut source: R,
        declared_len: u64,
        cancel: CancellationToken,
    ) -> Result<BlobEntryMeta>
    where
        R: Read + Send + 'static,
    {
        let gate = tokio::select! {
            gate = self.writer.clone().lock_owned() => gate,
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
        };

        let counter = self.counter.clone();
        let namespace = namespace.to_string();
        let key = key.to_string();
        let meta = tokio::task::spawn_blocking(move || {
            write_blob(
                &gate,
                &counter,
                namespace,
                key,
                &mut source,
                declared_len,
                &cancel,
            )
        })
        .await??;

        debug!(
            "Wrote blob {}/{} ({} bytes, version {})",
            meta.namespace, meta.key, meta.raw_length, meta.version
        );
        Ok(meta)
    }

    /// Open `(namespace, key)` for reading. Returns `None` if absent.
    pub async fn read(&self, namespace: &str, key: &str) -> Result<Option<(BlobEntryMeta, BlobReader)>> {
        let path = self.path.clone();
        let options = self.options.clone();
        let namespace = namespace.to_string();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = open_reader(&path, &options)?;
            // Deferred: the snapshot is taken by the first SELECT below
            conn.execute_batch("BEGIN")?;
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM {} WHERE namespace = ?1 AND key = ?2",
                        BLOB_META_COLUMNS, TABLE
                    ),
                    params![namespace, key],
                    MetaRow::from_sqlite,
                )
                .optional()?;

            match row {
                None => Ok(None),
                Some(row) => {
                    let meta = BlobEntryMeta::try_from(row)?;
                    let reader = BlobReader::from_connection(Arc::new(StdMutex::new(conn)), &meta);
                    Ok(Some((meta, reader)))
                }
            }
        })
        .await?
    }

    pub async fn read_bytes(&self, namespace: &str, key: &str) -> Result<Option<(BlobEntryMeta, Vec<u8>)>> {
        match self.read(namespace, key).await? {
            Some((meta, reader)) => Ok(Some((meta, reader.into_bytes().await?))),
            None => Ok(None),
        }
    }

    pub async fn delete(
        &self,
        namespace: &str,
        key: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let mut clause = Clause::new(format!("DELETE FROM {} WHERE namespace = ?1", TABLE), namespace);
        if let Some(key) = key {
            clause.and("key =", key.to_string());
        }
        clause.range(from, to);

        let gate = self.writer.clone().lock_owned().await;
        let removed = tokio::task::spawn_blocking(move || -> Result<usize> {
            Ok(gate.execute(&clause.sql, params_from_iter(clause.params.iter()))?)
        })
        .await?? as u64;
        debug!("Deleted {} blob(s) from {}", removed, namespace);
        Ok(removed)
    }

    /// Stream the entries of `namespace` with a reader for each payload.
    ///
    /// Metadata is collected up front under one read snapshot. Every reader
    /// shares that snapshot's connection, which closes once the stream and
    /// the last reader are dropped.
    pub fn list(
        &self,
        namespace: &str,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<(BlobEntryMeta, BlobReader)>> {
        let path = self.path.clone();
        let options = self.options.clone();
        let namespace = namespace.to_string();

        blocking_channel_stream(move |tx| {
            let mut clause = Clause::new(
                format!("SELECT {} FROM {} WHERE namespace = ?1", BLOB_META_COLUMNS, TABLE),
                &namespace,
            );
            clause.filter(&filter);
            clause.sql.push_str(" ORDER BY doc_id");

            let run = || -> Result<()> {
                let conn = open_reader(&path, &options)?;
                conn.execute_batch("BEGIN")?;
                let mut rows = Vec::new();
                {
                    let mut stmt = conn.prepare(&clause.sql)?;
                    for row in stmt.query_map(params_from_iter(clause.params.iter()), MetaRow::from_sqlite)? {
                        rows.push(row?);
                    }
                }

                let conn: SharedConn = Arc::new(StdMutex::new(conn));
                for row in rows {
                    let item = BlobEntryMeta::try_from(row).map(|meta| {
                        let reader = BlobReader::from_connection(conn.clone(), &meta);
                        (meta, reader)
                    });
                    let failed = item.is_err();
                    if tx.blocking_send(item).is_err() || failed {
                        break;
                    }
                }
                Ok(())
            };
            if let Err(e) = run() {
                let _ = tx.blocking_send(Err(e));
            }
        })
    }

    /// Stream blob metadata. Each listing reads from its own snapshot.
    pub fn list_meta(
        &self,
        namespace: NamespaceFilter,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<BlobEntryMeta>> {
        let path = self.path.clone();
        let options = self.options.clone();

        blocking_channel_stream(move |tx| {
            let mut clause = Clause::unfiltered(format!(
                "SELECT {} FROM {} WHERE 1 = 1",
                BLOB_META_COLUMNS, TABLE
            ));
            clause.namespace(namespace);
            clause.filter(&filter);
            clause.sql.push_str(" ORDER BY doc_id");

            let run = || -> Result<()> {
                let conn = open_reader(&path, &options)?;
                let mut stmt = conn.prepare(&clause.sql)?;
                let mut rows = stmt.query(params_from_iter(clause.params.iter()))?;
                while let Some(row) = rows.next()? {
                    let item = MetaRow::from_sqlite(row)
                        .map_err(StoreError::from)
                        .and_then(BlobEntryMeta::try_from);
                    let failed = item.is_err();
                    if tx.blocking_send(item).is_err() || failed {
                        break;
                    }
                }
                Ok(())
            };
            if let Err(e) = run() {
                let _ = tx.blocking_send(Err(e));
            }
        })
    }

    pub async fn count(&self, namespace: Option<&str>, key_pattern: Option<&LikeExpr>) -> Result<u64> {
        let mut clause = Clause::unfiltered(format!("SELECT COUNT(*) FROM {} WHERE 1 = 1", TABLE));
        if let Some(namespace) = namespace {
            clause.and("namespace =", namespace.to_string());
        }
        if let Some(pattern) = key_pattern {
            clause.and("key LIKE", pattern.pattern().to_string());
        }

        let path = self.path.clone();
        let options = self.options.clone();
        let count = tokio::task::spawn_blocking(move || -> Result<i64> {
            let conn = open_reader(&path, &options)?;
            Ok(conn.query_row(&clause.sql, params_from_iter(clause.params.iter()), |row| {
                row.get(0)
            })?)
        })
        .await??;
        Ok(count as u64)
    }

    pub async fn flush(&self, force: bool) -> Result<()> {
        let gate = self.writer.clone().lock_owned().await;
        let (busy, log, checkpointed) =
            tokio::task::spawn_blocking(move || -> Result<(i64, i64, i64)> {
                Ok(gate.query_row(checkpoint_sql(force), [], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?)
            })
            .await??;
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
        let gate = self.writer.clone().lock_owned().await;
        let result = tokio::task::spawn_blocking(move || gate.execute_batch(VACUUM)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(path = %self.path.display(), error = %e, "Compaction failed"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Compaction task failed"),
        }
    }
}

fn write_blob(
    conn: &Connection,
    counter: &AtomicU64,
    namespace: String,
    key: String,
    source: &mut impl Read,
    declared_len: u64,
    cancel: &CancellationToken,
) -> Result<BlobEntryMeta> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }

    let candidate = (counter.fetch_add(1, Ordering::SeqCst) + 1) as i64;
    // Oversized lengths are rejected by SQLite itself (SQLITE_TOOBIG)
    let reserve = i64::try_from(declared_len).unwrap_or(i64::MAX);
    let (doc_id, last_modified, created, version): (i64, i64, i64, i64) = conn.query_row(
        UPSERT_ZEROBLOB,
        params![candidate, namespace, key, now_ticks(), reserve],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;

    let meta = BlobEntryMeta {
        doc_id: doc_id as u64,
        namespace,
        key,
        last_modified: from_ticks(last_modified)?,
        created: from_ticks(created)?,
        version: version as u64,
        raw_length: declared_len,
    };

    let mut blob = conn.blob_open(DatabaseName::Main, TABLE, DATA_COLUMN, doc_id, false)?;
    let mut buf = vec![0u8; CHUNK_SIZE.min(declared_len as usize)];
    let mut written: u64 = 0;
    while written < declared_len {
        if cancel.is_cancelled() {
            debug!(
                "Blob write {}/{} cancelled after {} of {} bytes",
                meta.namespace, meta.key, written, declared_len
            );
            return Err(StoreError::Cancelled);
        }
        let want = (declared_len - written).min(buf.len() as u64) as usize;
        let n = read_some(source, &mut buf[..want])?;
        if n == 0 {
            return Err(StoreError::StreamLengthMismatch {
                expected: declared_len,
                actual: written,
            });
        }
        blob.write_at(&buf[..n], written as usize)?;
        written += n as u64;
    }

    Ok(meta)
}

fn read_some(source: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// SQL text plus positional parameters, numbered `?1..?N` in push order
struct Clause {
    sql: String,
    params: Vec<SqlValue>,
}

impl Clause {
    /// Start from a statement already binding `?1` to the namespace
    fn new(sql: String, namespace: &str) -> Self {
        Self {
            sql,
            params: vec![SqlValue::Text(namespace.to_string())],
        }
    }

    fn unfiltered(sql: String) -> Self {
        Self {
            sql,
            params: Vec::new(),
        }
    }

    fn and(&mut self, predicate: &str, value: impl Into<SqlValue>) {
        self.params.push(value.into());
        let _ = write!(self.sql, " AND {} ?{}", predicate, self.params.len());
    }

    fn range(&mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) {
        if let Some(from) = from {
            self.and("last_modified >=", to_ticks(from));
        }
        if let Some(to) = to {
            self.and("last_modified <=", to_ticks(to));
        }
    }

    fn filter(&mut self, filter: &ListFilter) {
        if let Some(pattern) = &filter.key_pattern {
            self.and("key LIKE", pattern.pattern().to_string());
        }
        self.range(filter.from, filter.to);
    }

    fn namespace(&mut self, namespace: NamespaceFilter) {
        match namespace {
            NamespaceFilter::All => {}
            NamespaceFilter::Exact(ns) => self.and("namespace =", ns),
            NamespaceFilter::Like(pattern) => self.and("namespace LIKE", pattern.pattern().to_string()),
        }
    }
}

enum ReaderSource {
    /// Connection with an open read transaction pinning the snapshot
    Sqlite {
        conn: SharedConn,
        row_id: i64,
        window: Window,
    },
    Memory(Arc<[u8]>),
}

/// The last `CHUNK_SIZE` block fetched through incremental blob I/O
#[derive(Default)]
struct Window {
    start: u64,
    data: Vec<u8>,
}

impl Window {
    fn covers(&self, pos: u64) -> bool {
        pos >= self.start && pos < self.start + self.data.len() as u64
    }

    fn fill(&mut self, conn: &SharedConn, row_id: i64, pos: u64, size: usize) -> io::Result<()> {
        let conn = conn
            .lock()
            .map_err(|_| io::Error::other("blob reader connection poisoned"))?;
        let blob = conn
            .blob_open(DatabaseName::Main, TABLE, DATA_COLUMN, row_id, true)
            .map_err(io::Error::other)?;
        self.data.resize(size, 0);
        if let Err(e) = blob.read_at_exact(&mut self.data, pos as usize) {
            self.data.clear();
            return Err(io::Error::other(e));
        }
        self.start = pos;
        Ok(())
    }

    fn copy_to(&self, pos: u64, buf: &mut [u8]) -> usize {
        let offset = (pos - self.start) as usize;
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        n
    }
}

/// Blocking reader over a stored payload.
///
/// Backed either by a dedicated connection holding a read snapshot, or by
/// bytes already in memory. Dropping it ends the snapshot and closes the
/// connection. Use it from a blocking context, or call [`BlobReader::into_bytes`].
pub struct BlobReader {
    source: ReaderSource,
    pos: u64,
    len: u64,
}

impl BlobReader {
    fn from_connection(conn: SharedConn, meta: &BlobEntryMeta) -> Self {
        Self {
            source: ReaderSource::Sqlite {
                conn,
                row_id: meta.doc_id as i64,
                window: Window::default(),
            },
            pos: 0,
            len: meta.raw_length,
        }
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        Self {
            source: ReaderSource::Memory(bytes),
            pos: 0,
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the remainder of the payload on the blocking pool
    pub async fn into_bytes(mut self) -> Result<Vec<u8>> {
        if let ReaderSource::Memory(bytes) = &self.source {
            let start = self.pos.min(self.len) as usize;
            return Ok(bytes[start..].to_vec());
        }
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut out = Vec::with_capacity(self.len.saturating_sub(self.pos) as usize);
            self.read_to_end(&mut out)?;
            Ok(out)
        })
        .await?
    }
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.source {
            ReaderSource::Sqlite { .. } => "sqlite",
            ReaderSource::Memory(_) => "memory",
        };
        f.debug_struct("BlobReader")
            .field("source", &kind)
            .field("pos", &self.pos)
            .field("len", &self.len)
            .finish()
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        let pos = self.pos;
        let n = match &mut self.source {
            ReaderSource::Sqlite {
                conn,
                row_id,
                window,
            } => {
                if !window.covers(pos) {
                    let size = remaining.min(CHUNK_SIZE as u64) as usize;
                    window.fill(conn, *row_id, pos, size)?;
                }
                window.copy_to(pos, &mut buf[..n])
            }
            ReaderSource::Memory(bytes) => {
                let start = pos as usize;
                buf[..n].copy_from_slice(&bytes[start..start + n]);
                n
            }
        };
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for BlobReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(target) => {
                self.pos = target;
                Ok(target)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of blob",
            )),
        }
    }
}

impl BlobStorage for BlobStore {
    async fn write<R>(
        &self,
        namespace: &str,
        key: &str,
        source: R,
        declared_len: u64,
        cancel: CancellationToken,
    ) -> Result<BlobEntryMeta>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        BlobStore::write(self, namespace, key, source, declared_len, cancel).await
    }

    async fn write_bytes(&self, namespace: &str, key: &str, data: &[u8]) -> Result<BlobEntryMeta> {
        BlobStore::write_bytes(self, namespace, key, data).await
    }

    async fn read(&self, namespace: &str, key: &str) -> Result<Option<(BlobEntryMeta, BlobReader)>> {
        BlobStore::read(self, namespace, key).await
    }

    async fn read_bytes(&self, namespace: &str, key: &str) -> Result<Option<(BlobEntryMeta, Vec<u8>)>> {
        BlobStore::read_bytes(self, namespace, key).await
    }

    async fn delete(
        &self,
        namespace: &str,
        key: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        BlobStore::delete(self, namespace, key, from, to).await
    }

    fn list(
        &self,
        namespace: &str,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<(BlobEntryMeta, BlobReader)>> {
        BlobStore::list(self, namespace, filter)
    }

    fn list_meta(
        &self,
        namespace: NamespaceFilter,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<BlobEntryMeta>> {
        BlobStore::list_meta(self, namespace, filter)
    }

    async fn count(&self, namespace: Option<&str>, key_pattern: Option<&LikeExpr>) -> Result<u64> {
        BlobStore::count(self, namespace, key_pattern).await
    }

    async fn flush(&self, force: bool) -> Result<()> {
        BlobStore::flush(self, force).await
    }

    async fn compact(&self) {
        BlobStore::compact(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncWriteExt, ReadBuf};

    async fn open_temp() -> (TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs.db")).await.unwrap();
        (dir, store)
    }

    /// Deterministic pseudo-random payload
    fn payload(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    /// Yields one chunk per poll and cancels the token after the first one
    struct CancelAfterFirstRead {
        data: Vec<u8>,
        pos: usize,
        token: CancellationToken,
    }

    impl AsyncRead for CancelAfterFirstRead {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let n = buf.remaining().min(self.data.len() - self.pos);
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            self.token.cancel();
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_round_trip_across_chunks() {
        let (_dir, store) = open_temp().await;
        let data = payload(CHUNK_SIZE * 3 + 17, 1);
        let meta = store
            .write(
                "ns",
                "k",
                io::Cursor::new(data.clone()),
                data.len() as u64,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(meta.raw_length, data.len() as u64);
        assert_eq!(meta.version, 1);
        assert_eq!(meta.doc_id, 1);

        let (read_meta, bytes) = store.read_bytes("ns", "k").await.unwrap().unwrap();
        assert_eq!(read_meta, meta);
        assert_eq!(bytes, data);
    }

    #[tokio::test]
    async fn test_declared_length_one_short_truncates() {
        let (_dir, store) = open_temp().await;
        let data = payload(1000, 2);
        let meta = store
            .write(
                "ns",
                "k",
                io::Cursor::new(data.clone()),
                999,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(meta.raw_length, 999);

        let (_, bytes) = store.read_bytes("ns", "k").await.unwrap().unwrap();
        assert_eq!(bytes, data[..999]);
    }

    #[tokio::test]
    async fn test_declared_length_one_long_fails() {
        let (_dir, store) = open_temp().await;
        let data = payload(1000, 3);
        let err = store
            .write(
                "ns",
                "k",
                io::Cursor::new(data.clone()),
                1001,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            StoreError::StreamLengthMismatch { expected, actual } => {
                assert_eq!(expected, 1001);
                assert_eq!(actual, 1000);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The row keeps its reserved size with the copied prefix
        let (meta, bytes) = store.read_bytes("ns", "k").await.unwrap().unwrap();
        assert_eq!(meta.raw_length, 1001);
        assert_eq!(bytes[..1000], data[..]);
        assert_eq!(bytes[1000], 0);
    }

    #[tokio::test]
    async fn test_overwrite_bumps_version() {
        let (_dir, store) = open_temp().await;
        let first = store.write_bytes("ns", "k", b"hello").await.unwrap();
        let second = store.write_bytes("ns", "k", b"hi").await.unwrap();
        assert_eq!(second.doc_id, first.doc_id);
        assert_eq!(second.created, first.created);
        assert_eq!(second.version, 2);
        assert!(second.last_modified > first.last_modified);

        let (_, bytes) = store.read_bytes("ns", "k").await.unwrap().unwrap();
        assert_eq!(bytes, b"hi");
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let (_dir, store) = open_temp().await;
        store.write_bytes("ns", "empty", b"").await.unwrap();
        let (meta, reader) = store.read("ns", "empty").await.unwrap().unwrap();
        assert_eq!(meta.raw_length, 0);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_write() {
        let (_dir, store) = open_temp().await;
        let token = CancellationToken::new();
        token.cancel();
        let err = store
            .write("ns", "k", io::Cursor::new(vec![1u8; 10]), 10, token)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert!(store.read("ns", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_mid_copy_leaves_partial_row() {
        let (_dir, store) = open_temp().await;
        let token = CancellationToken::new();
        let source = CancelAfterFirstRead {
            data: vec![7u8; CHUNK_SIZE * 2],
            pos: 0,
            token: token.clone(),
        };
        let err = store
            .write("ns", "k", source, (CHUNK_SIZE * 2) as u64, token)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));

        let (meta, bytes) = store.read_bytes("ns", "k").await.unwrap().unwrap();
        assert_eq!(meta.raw_length, (CHUNK_SIZE * 2) as u64);
        assert!(bytes[..CHUNK_SIZE].iter().all(|b| *b == 7));
        assert!(bytes[CHUNK_SIZE..].iter().all(|b| *b == 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reads_proceed_while_writer_holds_gate() {
        let (_dir, store) = open_temp().await;
        store.write_bytes("ns", "a", b"stable").await.unwrap();

        let (mut feed, source) = tokio::io::duplex(64);
        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .write("ns", "b", source, 10, CancellationToken::new())
                    .await
            })
        };
        // Let the writer take the gate and block on the empty pipe
        tokio::time::sleep(Duration::from_millis(50)).await;

        let read = tokio::time::timeout(Duration::from_secs(5), store.read_bytes("ns", "a"))
            .await
            .expect("read blocked by writer")
            .unwrap()
            .unwrap();
        assert_eq!(read.1, b"stable");

        let count = tokio::time::timeout(Duration::from_secs(5), store.count(Some("ns"), None))
            .await
            .expect("count blocked by writer")
            .unwrap();
        assert!(count >= 1);

        feed.write_all(&[9u8; 10]).await.unwrap();
        let meta = writer.await.unwrap().unwrap();
        assert_eq!(meta.raw_length, 10);

        let (_, bytes) = store.read_bytes("ns", "b").await.unwrap().unwrap();
        assert_eq!(bytes, vec![9u8; 10]);
    }

    #[tokio::test]
    async fn test_reader_keeps_snapshot_across_overwrite() {
        let (_dir, store) = open_temp().await;
        store.write_bytes("ns", "k", b"first").await.unwrap();
        let (_, reader) = store.read("ns", "k").await.unwrap().unwrap();

        store.write_bytes("ns", "k", b"second!").await.unwrap();
        assert_eq!(reader.into_bytes().await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_reader_seek() {
        let (_dir, store) = open_temp().await;
        store.write_bytes("ns", "k", b"0123456789").await.unwrap();
        let (_, mut reader) = store.read("ns", "k").await.unwrap().unwrap();

        let tail = tokio::task::spawn_blocking(move || {
            reader.seek(SeekFrom::End(-3)).unwrap();
            let mut tail = String::new();
            reader.read_to_string(&mut tail).unwrap();
            assert!(reader.seek(SeekFrom::Current(-20)).is_err());
            tail
        })
        .await
        .unwrap();
        assert_eq!(tail, "789");
    }

    #[tokio::test]
    async fn test_memory_reader() {
        let mut reader = BlobReader::from_bytes(b"abcdef".to_vec());
        reader.seek(SeekFrom::Start(2)).unwrap();
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"cd");
        assert_eq!(reader.into_bytes().await.unwrap(), b"ef");
    }

    #[tokio::test]
    async fn test_seek_past_end_reads_nothing() {
        let mut reader = BlobReader::from_bytes(b"abcdef".to_vec());
        assert_eq!(reader.seek(SeekFrom::Start(100)).unwrap(), 100);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert!(reader.into_bytes().await.unwrap().is_empty());

        let (_dir, store) = open_temp().await;
        store.write_bytes("ns", "k", b"abcdef").await.unwrap();
        let (_, mut reader) = store.read("ns", "k").await.unwrap().unwrap();
        reader.seek(SeekFrom::End(10)).unwrap();
        assert!(reader.into_bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_small_reads_across_chunk_boundaries() {
        let (_dir, store) = open_temp().await;
        let data = payload(CHUNK_SIZE * 2 + 100, 11);
        store.write_bytes("ns", "k", &data).await.unwrap();
        let (_, mut reader) = store.read("ns", "k").await.unwrap().unwrap();

        let expected = data.clone();
        tokio::task::spawn_blocking(move || {
            let mut copied = Vec::new();
            let mut buf = [0u8; 8 * 1024];
            loop {
                let n = reader.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                copied.extend_from_slice(&buf[..n]);
            }
            assert_eq!(copied, expected);

            // Straddle the first block boundary, then jump back inside it
            reader.seek(SeekFrom::Start(CHUNK_SIZE as u64 - 2)).unwrap();
            let mut pair = [0u8; 4];
            reader.read_exact(&mut pair).unwrap();
            assert_eq!(pair[..], expected[CHUNK_SIZE - 2..CHUNK_SIZE + 2]);
            reader.seek(SeekFrom::Start(5)).unwrap();
            reader.read_exact(&mut pair).unwrap();
            assert_eq!(pair[..], expected[5..9]);
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_list_with_payloads() {
        let (_dir, store) = open_temp().await;
        let big = payload(CHUNK_SIZE + 33, 12);
        store.write_bytes("img", "42.big", &big).await.unwrap();
        store.write_bytes("img", "42.small", b"tiny").await.unwrap();
        store.write_bytes("img", "7.other", b"skip").await.unwrap();
        store.write_bytes("doc", "42.x", b"skip").await.unwrap();

        let mut entries = store.list("img", ListFilter::keys("42.%"));
        let (first, first_reader) = entries.try_next().await.unwrap().unwrap();
        // Later rows come from the snapshot taken by the listing
        store.write_bytes("img", "42.small", b"changed").await.unwrap();
        let (second, second_reader) = entries.try_next().await.unwrap().unwrap();
        assert!(entries.try_next().await.unwrap().is_none());

        assert_eq!(first.key, "42.big");
        assert_eq!(first_reader.into_bytes().await.unwrap(), big);
        assert_eq!(second.key, "42.small");
        assert_eq!(second.version, 1);
        assert_eq!(second_reader.into_bytes().await.unwrap(), b"tiny");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_waits_for_streaming_writer() {
        let (_dir, store) = open_temp().await;
        store.write_bytes("ns", "old", b"x").await.unwrap();

        let (mut feed, source) = tokio::io::duplex(64);
        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .write("ns", "b", source, 10, CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let deleter = {
            let store = store.clone();
            tokio::spawn(async move { store.delete("ns", Some("old"), None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!deleter.is_finished());

        feed.write_all(&[1u8; 10]).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(deleter.await.unwrap().unwrap(), 1);
        assert!(store.read("ns", "old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_count_delete() {
        let (_dir, store) = open_temp().await;
        for i in 0..6 {
            store
                .write_bytes("img", &format!("42.{}", i), &payload(10 + i, i as u64))
                .await
                .unwrap();
        }
        store.write_bytes("img", "7.0", b"x").await.unwrap();
        store.write_bytes("doc", "42.0", b"y").await.unwrap();

        let metas: Vec<BlobEntryMeta> = store
            .list_meta(NamespaceFilter::from("img"), ListFilter::keys("42.%"))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(metas.len(), 6);
        let total: u64 = metas.iter().map(|m| m.raw_length).sum();
        assert_eq!(total, (10..16).sum::<usize>() as u64);

        assert_eq!(store.count(None, None).await.unwrap(), 8);
        assert_eq!(
            store.count(None, Some(&LikeExpr::new("42.%"))).await.unwrap(),
            7
        );

        assert_eq!(store.delete("img", Some("7.0"), None, None).await.unwrap(), 1);
        assert_eq!(store.delete("img", None, None, None).await.unwrap(), 6);
        assert_eq!(store.count(Some("img"), None).await.unwrap(), 0);
        assert_eq!(store.count(Some("doc"), None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_doc_id_recovered_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.db");
        let last = {
            let store = BlobStore::open(&path).await.unwrap();
            let mut last = 0;
            for i in 0..5 {
                last = store.write_bytes("ns", &i.to_string(), b"z").await.unwrap().doc_id;
            }
            last
        };

        let store = BlobStore::open(&path).await.unwrap();
        let meta = store.write_bytes("ns", "new", b"z").await.unwrap();
        assert!(meta.doc_id > last);
    }

    #[tokio::test]
    async fn test_flush_and_compact() {
        let (_dir, store) = open_temp().await;
        store.write_bytes("ns", "k", &payload(4096, 9)).await.unwrap();
        store.delete("ns", None, None, None).await.unwrap();
        store.flush(false).await.unwrap();
        store.flush(true).await.unwrap();
        store.compact().await;
        assert_eq!(store.count(None, None).await.unwrap(), 0);
    }
}
