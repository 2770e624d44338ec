//! Caching wrapper for blob stores.
//!
//! Only payloads up to `max_blob_bytes` are kept in memory. Streamed writes
//! of cacheable size are teed while the store consumes them, so the cached
//! copy is refreshed without reading the row back.

use crate::types::{CacheConfig, CacheStats};
use crate::{build_cache, cache_key, invalidate_namespace, CacheKey, FillGate};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use moka::future::Cache;
use shelf_db::{
    BlobEntryMeta, BlobReader, BlobStorage, LikeExpr, ListFilter, NamespaceFilter, Result,
    RetentionTarget,
};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
struct CachedBlob {
    meta: BlobEntryMeta,
    bytes: Arc<[u8]>,
}

/// A [`BlobStorage`] that keeps small payloads in an LRU + TTL cache
pub struct CachedBlobStore<S> {
    inner: S,
    cache: Cache<CacheKey, CachedBlob>,
    gate: FillGate,
    max_blob_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Copies everything read through it into a shared buffer
struct TeeReader<R> {
    inner: R,
    captured: Arc<Mutex<Vec<u8>>>,
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            if let Ok(mut captured) = self.captured.lock() {
                captured.extend_from_slice(&buf.filled()[before..]);
            }
        }
        poll
    }
}

impl<S: BlobStorage> CachedBlobStore<S> {
    pub fn new(inner: S, config: CacheConfig) -> Self {
        Self {
            inner,
            cache: build_cache(&config),
            gate: FillGate::default(),
            max_blob_bytes: config.max_blob_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The wrapped store. Deleting through it bypasses cache invalidation.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn cacheable(&self, len: u64) -> bool {
        len <= self.max_blob_bytes
    }

    /// Insert without taking the gate; callers hold it
    async fn remember(&self, meta: &BlobEntryMeta, bytes: Arc<[u8]>) {
        self.cache
            .insert(
                cache_key(&meta.namespace, &meta.key),
                CachedBlob {
                    meta: meta.clone(),
                    bytes,
                },
            )
            .await;
    }

    async fn forget(&self, namespace: &str, key: Option<&str>) {
        let _gate = self.gate.invalidation().await;
        match key {
            Some(key) => self.cache.invalidate(&cache_key(namespace, key)).await,
            None => invalidate_namespace(&self.cache, namespace).await,
        }
    }

    /// Refresh after a successful write. `bytes` is `None` when the written
    /// payload was not captured.
    async fn refresh(&self, seen: u64, meta: &BlobEntryMeta, bytes: Option<Arc<[u8]>>) {
        let (_gate, latest) = self.gate.mutation(seen).await;
        match bytes {
            Some(bytes) if latest => self.remember(meta, bytes).await,
            _ => {
                self.cache
                    .invalidate(&cache_key(&meta.namespace, &meta.key))
                    .await
            }
        }
    }

    /// Fill after a miss, unless the store changed while fetching
    async fn fill(&self, seen: u64, meta: &BlobEntryMeta, bytes: Arc<[u8]>) {
        match self.gate.fill(seen).await {
            Some(_gate) => self.remember(meta, bytes).await,
            None => debug!(
                "Skipping cache fill for {}/{} after a concurrent change",
                meta.namespace, meta.key
            ),
        }
    }

    async fn lookup(&self, namespace: &str, key: &str) -> Option<CachedBlob> {
        match self.cache.get(&cache_key(namespace, key)).await {
            Some(hit) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit: {}/{}", namespace, key);
                Some(hit)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

impl<S: BlobStorage> BlobStorage for CachedBlobStore<S> {
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
        if !self.cacheable(declared_len) {
            let result = self
                .inner
                .write(namespace, key, source, declared_len, cancel)
                .await;
            self.forget(namespace, Some(key)).await;
            return result;
        }

        let captured = Arc::new(Mutex::new(Vec::with_capacity(declared_len as usize)));
        let tee = TeeReader {
            inner: source,
            captured: captured.clone(),
        };
        let seen = self.gate.observe().await;
        match self
            .inner
            .write(namespace, key, tee, declared_len, cancel)
            .await
        {
            Ok(meta) => {
                let bytes = captured
                    .lock()
                    .ok()
                    .map(|mut b| std::mem::take(&mut *b))
                    .filter(|b| b.len() as u64 == meta.raw_length)
                    .map(Arc::from);
                self.refresh(seen, &meta, bytes).await;
                Ok(meta)
            }
            Err(e) => {
                // The row may now hold partial content
                self.forget(namespace, Some(key)).await;
                Err(e)
            }
        }
    }

    async fn write_bytes(&self, namespace: &str, key: &str, data: &[u8]) -> Result<BlobEntryMeta> {
        let seen = self.gate.observe().await;
        let result = self.inner.write_bytes(namespace, key, data).await;
        match &result {
            Ok(meta) if self.cacheable(meta.raw_length) => {
                self.refresh(seen, meta, Some(Arc::from(data))).await;
            }
            _ => self.forget(namespace, Some(key)).await,
        }
        result
    }

    async fn read(&self, namespace: &str, key: &str) -> Result<Option<(BlobEntryMeta, BlobReader)>> {
        if let Some(hit) = self.lookup(namespace, key).await {
            return Ok(Some((hit.meta, BlobReader::from_bytes(hit.bytes))));
        }

        let seen = self.gate.observe().await;
        match self.inner.read(namespace, key).await? {
            Some((meta, reader)) if self.cacheable(meta.raw_length) => {
                let bytes: Arc<[u8]> = reader.into_bytes().await?.into();
                self.fill(seen, &meta, bytes.clone()).await;
                Ok(Some((meta, BlobReader::from_bytes(bytes))))
            }
            other => Ok(other),
        }
    }

    async fn read_bytes(&self, namespace: &str, key: &str) -> Result<Option<(BlobEntryMeta, Vec<u8>)>> {
        if let Some(hit) = self.lookup(namespace, key).await {
            return Ok(Some((hit.meta, hit.bytes.to_vec())));
        }

        let seen = self.gate.observe().await;
        let found = self.inner.read_bytes(namespace, key).await?;
        if let Some((meta, bytes)) = &found {
            if self.cacheable(meta.raw_length) {
                self.fill(seen, meta, Arc::from(bytes.as_slice())).await;
            }
        }
        Ok(found)
    }

    async fn delete(
        &self,
        namespace: &str,
        key: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let result = self.inner.delete(namespace, key, from, to).await;
        self.forget(namespace, key).await;
        result
    }

    fn list(
        &self,
        namespace: &str,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<(BlobEntryMeta, BlobReader)>> {
        self.inner.list(namespace, filter)
    }

    fn list_meta(
        &self,
        namespace: NamespaceFilter,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<BlobEntryMeta>> {
        self.inner.list_meta(namespace, filter)
    }

    async fn count(&self, namespace: Option<&str>, key_pattern: Option<&LikeExpr>) -> Result<u64> {
        self.inner.count(namespace, key_pattern).await
    }

    async fn flush(&self, force: bool) -> Result<()> {
        self.inner.flush(force).await
    }

    async fn compact(&self) {
        self.inner.compact().await
    }
}

impl<S> RetentionTarget for CachedBlobStore<S>
where
    S: BlobStorage + RetentionTarget<Meta = BlobEntryMeta>,
{
    type Meta = BlobEntryMeta;

    fn list_for_retention(
        &self,
        namespace: &str,
        key_pattern: Option<&LikeExpr>,
    ) -> BoxStream<'static, Result<BlobEntryMeta>> {
        self.inner.list_for_retention(namespace, key_pattern)
    }

    async fn delete_entry(&self, meta: &BlobEntryMeta) -> Result<u64> {
        let result = self.inner.delete_entry(meta).await;
        self.forget(&meta.namespace, Some(&meta.key)).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_db::{BlobStore, RetentionEngine, RetentionOptions, RetentionRule, StoreError};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn cached(max_blob_bytes: u64) -> (TempDir, CachedBlobStore<BlobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs.db")).await.unwrap();
        let config = CacheConfig::new(16, Duration::from_secs(60)).with_max_blob_bytes(max_blob_bytes);
        (dir, CachedBlobStore::new(store, config))
    }

    #[tokio::test]
    async fn test_streamed_write_refreshes_cache() {
        let (_dir, store) = cached(1024).await;
        let data = vec![5u8; 300];
        store
            .write(
                "ns",
                "k",
                io::Cursor::new(data.clone()),
                300,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let (meta, bytes) = store.read_bytes("ns", "k").await.unwrap().unwrap();
        assert_eq!(bytes, data);
        assert_eq!(meta.raw_length, 300);
        assert_eq!(store.cache_stats().hits, 1);
        assert_eq!(store.cache_stats().misses, 0);
    }

    #[tokio::test]
    async fn test_teed_copy_matches_declared_length() {
        let (_dir, store) = cached(1024).await;
        // Source longer than declared: only the stored prefix is cached
        store
            .write(
                "ns",
                "k",
                io::Cursor::new(vec![1u8; 200]),
                150,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let (_, bytes) = store.read_bytes("ns", "k").await.unwrap().unwrap();
        assert_eq!(bytes.len(), 150);
        assert_eq!(store.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_large_payload_passes_through() {
        let (_dir, store) = cached(64).await;
        store.write_bytes("ns", "big", &[3u8; 128]).await.unwrap();

        for _ in 0..2 {
            let (_, bytes) = store.read_bytes("ns", "big").await.unwrap().unwrap();
            assert_eq!(bytes.len(), 128);
        }
        let stats = store.cache_stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_read_miss_populates_and_returns_full_reader() {
        let (_dir, store) = cached(1024).await;
        store.inner().write_bytes("ns", "k", b"from disk").await.unwrap();

        let (_, reader) = store.read("ns", "k").await.unwrap().unwrap();
        assert_eq!(reader.into_bytes().await.unwrap(), b"from disk");
        let (_, reader) = store.read("ns", "k").await.unwrap().unwrap();
        assert_eq!(reader.into_bytes().await.unwrap(), b"from disk");
        assert_eq!(store.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_failed_write_drops_cached_copy() {
        let (_dir, store) = cached(1024).await;
        store.write_bytes("ns", "k", b"good").await.unwrap();

        let err = store
            .write(
                "ns",
                "k",
                io::Cursor::new(b"short".to_vec()),
                10,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StreamLengthMismatch { .. }));

        let (meta, bytes) = store.read_bytes("ns", "k").await.unwrap().unwrap();
        assert_eq!(meta.raw_length, 10);
        assert_eq!(&bytes[..5], b"short");
        assert_eq!(store.cache_stats().hits, 0);
    }

    #[tokio::test]
    async fn test_fill_started_before_write_is_dropped() {
        let (_dir, store) = cached(1024).await;
        let old_meta = store.inner().write_bytes("ns", "k", b"old").await.unwrap();

        // A miss fetched "old", then a write landed before the fill
        let seen = store.gate.observe().await;
        store.write_bytes("ns", "k", b"new").await.unwrap();
        store.fill(seen, &old_meta, Arc::from(&b"old"[..])).await;

        let (meta, bytes) = store.read_bytes("ns", "k").await.unwrap().unwrap();
        assert_eq!(bytes, b"new");
        assert_eq!(meta.version, old_meta.version + 1);
    }

    #[tokio::test]
    async fn test_fill_started_before_delete_is_dropped() {
        let (_dir, store) = cached(1024).await;
        store.inner().write_bytes("ns", "k", b"old").await.unwrap();
        let (old_meta, _) = store.inner().read_bytes("ns", "k").await.unwrap().unwrap();

        let seen = store.gate.observe().await;
        store.delete("ns", Some("k"), None, None).await.unwrap();
        store.fill(seen, &old_meta, Arc::from(&b"old"[..])).await;

        assert!(store.read_bytes("ns", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_passes_through_with_payloads() {
        use futures::TryStreamExt;

        let (_dir, store) = cached(1024).await;
        store.write_bytes("ns", "a", b"first").await.unwrap();
        store.write_bytes("ns", "b", b"second").await.unwrap();
        store.write_bytes("other", "c", b"third").await.unwrap();

        let entries: Vec<_> = store
            .list("ns", ListFilter::default())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        let mut payloads = Vec::new();
        for (meta, reader) in entries {
            payloads.push((meta.key, reader.into_bytes().await.unwrap()));
        }
        assert_eq!(
            payloads,
            vec![
                ("a".to_string(), b"first".to_vec()),
                ("b".to_string(), b"second".to_vec())
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_invalidates() {
        let (_dir, store) = cached(1024).await;
        store.write_bytes("ns", "a", b"1").await.unwrap();
        store.write_bytes("ns", "b", b"2").await.unwrap();

        store.delete("ns", None, None, None).await.unwrap();
        assert!(store.read_bytes("ns", "a").await.unwrap().is_none());
        assert!(store.read_bytes("ns", "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_engine_attached_to_wrapper_invalidates() {
        let (_dir, store) = cached(1024).await;
        store.write_bytes("tmp", "k", &[0u8; 100]).await.unwrap();
        let store = Arc::new(store);

        let handle = RetentionEngine::attach(
            store.clone(),
            RetentionOptions::new(vec![RetentionRule::total_size("tmp", 10)]),
        );
        let status = handle.wait_for_cycles(1).await;
        assert_eq!(status.last_deleted, 1);
        assert!(store.read_bytes("tmp", "k").await.unwrap().is_none());
    }
}
