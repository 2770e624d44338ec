//! Caching wrapper for document stores

use crate::types::{CacheConfig, CacheStats};
use crate::{build_cache, cache_key, invalidate_namespace, CacheKey, FillGate};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use moka::future::Cache;
use serde_json::Value;
use shelf_db::{
    DocumentEntry, DocumentEntryMeta, DocumentStorage, LikeExpr, ListFilter, NamespaceFilter,
    Result, RetentionTarget,
};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A [`DocumentStorage`] with an LRU + TTL cache in front of point reads
pub struct CachedDocumentStore<S> {
    inner: S,
    cache: Cache<CacheKey, DocumentEntry>,
    gate: FillGate,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: DocumentStorage> CachedDocumentStore<S> {
    pub fn new(inner: S, config: CacheConfig) -> Self {
        Self {
            inner,
            cache: build_cache(&config),
            gate: FillGate::default(),
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

    /// Invalidate after a delete, whatever its outcome
    async fn forget(&self, namespace: &str, key: Option<&str>) {
        let _gate = self.gate.invalidation().await;
        match key {
            Some(key) => self.cache.invalidate(&cache_key(namespace, key)).await,
            None => invalidate_namespace(&self.cache, namespace).await,
        }
    }
}

impl<S: DocumentStorage> DocumentStorage for CachedDocumentStore<S> {
    async fn write(&self, namespace: &str, key: &str, value: &Value) -> Result<DocumentEntry> {
        let seen = self.gate.observe().await;
        let entry = self.inner.write(namespace, key, value).await?;

        let k = cache_key(namespace, key);
        let (_gate, latest) = self.gate.mutation(seen).await;
        if latest {
            self.cache.insert(k, entry.clone()).await;
        } else {
            // Another write or delete finished concurrently and its order
            // against this one is unknown
            self.cache.invalidate(&k).await;
        }
        Ok(entry)
    }

    async fn read(&self, namespace: &str, key: &str) -> Result<Option<DocumentEntry>> {
        let k = cache_key(namespace, key);
        if let Some(entry) = self.cache.get(&k).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit: {}/{}", namespace, key);
            return Ok(Some(entry));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let seen = self.gate.observe().await;
        let entry = self.inner.read(namespace, key).await?;
        if let Some(entry) = &entry {
            if let Some(_gate) = self.gate.fill(seen).await {
                self.cache.insert(k, entry.clone()).await;
            } else {
                debug!("Skipping cache fill for {}/{} after a concurrent change", namespace, key);
            }
        }
        Ok(entry)
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

    fn list(&self, namespace: &str, filter: ListFilter) -> BoxStream<'static, Result<DocumentEntry>> {
        self.inner.list(namespace, filter)
    }

    fn list_meta(
        &self,
        namespace: NamespaceFilter,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<DocumentEntryMeta>> {
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

impl<S> RetentionTarget for CachedDocumentStore<S>
where
    S: DocumentStorage + RetentionTarget<Meta = DocumentEntryMeta>,
{
    type Meta = DocumentEntryMeta;

    fn list_for_retention(
        &self,
        namespace: &str,
        key_pattern: Option<&LikeExpr>,
    ) -> BoxStream<'static, Result<DocumentEntryMeta>> {
        self.inner.list_for_retention(namespace, key_pattern)
    }

    async fn delete_entry(&self, meta: &DocumentEntryMeta) -> Result<u64> {
        let result = self.inner.delete_entry(meta).await;
        self.forget(&meta.namespace, Some(&meta.key)).await;
        result
    }
}
