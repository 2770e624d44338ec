//! Cache configuration and statistics

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds for a caching store
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum cached entries; the least recently used is evicted beyond this
    pub capacity: u64,
    /// Entries older than this are treated as misses
    pub ttl: Duration,
    /// Blob payloads larger than this bypass the cache entirely
    pub max_blob_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            ttl: Duration::from_secs(5 * 60),
            max_blob_bytes: 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            ..Self::default()
        }
    }

    pub fn with_max_blob_bytes(mut self, max_blob_bytes: u64) -> Self {
        self.max_blob_bytes = max_blob_bytes;
        self
    }
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new(10, Duration::from_secs(1)).with_max_blob_bytes(64);
        assert_eq!(config.capacity, 10);
        assert_eq!(config.ttl, Duration::from_secs(1));
        assert_eq!(config.max_blob_bytes, 64);
    }

    #[test]
    fn test_cache_stats_serialization() {
        let stats = CacheStats {
            entries: 3,
            hits: 500,
            misses: 7,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"hits\":500"));
    }
}
