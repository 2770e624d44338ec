//! Read-through caching for shelf stores.
//!
//! [`CachedDocumentStore`] and [`CachedBlobStore`] wrap any store with a
//! bounded, TTL-limited point-lookup cache and implement the same storage
//! traits, so they can stand in for the bare store anywhere. Listings and
//! counts always go to the store.
//!
//! Deletions made directly on the wrapped store (for example by a retention
//! engine attached to it) stay visible through the cache until the entry's
//! TTL runs out. Attach the engine to the wrapper instead to have its
//! deletions invalidate the cache.

mod blob;
mod document;
mod types;

pub use blob::CachedBlobStore;
pub use document::CachedDocumentStore;
pub use types::{CacheConfig, CacheStats};

use moka::future::Cache;
use moka::policy::EvictionPolicy;
use tokio::sync::{Mutex, MutexGuard};

pub(crate) type CacheKey = (String, String);

pub(crate) fn cache_key(namespace: &str, key: &str) -> CacheKey {
    (namespace.to_string(), key.to_string())
}

pub(crate) fn build_cache<V>(config: &CacheConfig) -> Cache<CacheKey, V>
where
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(config.capacity)
        .time_to_live(config.ttl)
        .eviction_policy(EvictionPolicy::lru())
        .build()
}

/// Drop every cached entry of `namespace`
pub(crate) async fn invalidate_namespace<V>(cache: &Cache<CacheKey, V>, namespace: &str)
where
    V: Clone + Send + Sync + 'static,
{
    let keys: Vec<_> = cache
        .iter()
        .filter(|(k, _)| k.0 == namespace)
        .map(|(k, _)| k)
        .collect();
    for key in keys {
        cache.invalidate(key.as_ref()).await;
    }
}

/// Orders cache updates against store mutations.
///
/// Every mutation bumps the generation once its store call has returned,
/// and updates the cache while holding the gate. A fetch records the
/// generation before going to the store, and may only fill the cache if no
/// mutation completed in the meantime. Otherwise its result could be older
/// than what the mutation left behind.
#[derive(Default)]
pub(crate) struct FillGate {
    generation: Mutex<u64>,
}

impl FillGate {
    pub(crate) async fn observe(&self) -> u64 {
        *self.generation.lock().await
    }

    /// Enter as a mutation. The flag is true when nothing else mutated
    /// since `seen`, so the caller's result is the latest one.
    pub(crate) async fn mutation(&self, seen: u64) -> (MutexGuard<'_, u64>, bool) {
        let mut generation = self.generation.lock().await;
        let unchanged = *generation == seen;
        *generation += 1;
        (generation, unchanged)
    }

    /// Enter as a mutation whose cache effect is an invalidation
    pub(crate) async fn invalidation(&self) -> MutexGuard<'_, u64> {
        let mut generation = self.generation.lock().await;
        *generation += 1;
        generation
    }

    /// Enter as a fill; `None` when a mutation completed since `seen`
    pub(crate) async fn fill(&self, seen: u64) -> Option<MutexGuard<'_, u64>> {
        let generation = self.generation.lock().await;
        (*generation == seen).then_some(generation)
    }
}
