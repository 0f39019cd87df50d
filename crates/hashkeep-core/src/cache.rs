//! Record cache: bounded LRU of decoded values keyed by record key.
//!
//! The cache is updated or invalidated under the same write lock as the
//! disk write it mirrors, so a hit is never staler than the file.

use std::num::NonZeroUsize;

use lru::LruCache;

/// Cache statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries currently cached
    pub size: usize,
    /// Maximum entries (0 = disabled)
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// LRU cache of decoded record values; capacity 0 disables it.
pub struct RecordCache {
    entries: Option<LruCache<Vec<u8>, Vec<u8>>>,
    hits: u64,
    misses: u64,
}

impl RecordCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
            hits: 0,
            misses: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Look up a value, promoting it on hit.
    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let entries = self.entries.as_mut()?;
        match entries.get(key) {
            Some(value) => {
                self.hits += 1;
                Some(value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert or replace the cached value for `key`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        if let Some(entries) = self.entries.as_mut() {
            entries.put(key.to_vec(), value.to_vec());
        }
    }

    /// Drop `key` if cached.
    pub fn invalidate(&mut self, key: &[u8]) {
        if let Some(entries) = self.entries.as_mut() {
            entries.pop(key);
        }
    }

    /// Drop every entry; counters are kept.
    pub fn clear(&mut self) {
        if let Some(entries) = self.entries.as_mut() {
            entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            size: self.entries.as_ref().map_or(0, |e| e.len()),
            capacity: self.entries.as_ref().map_or(0, |e| e.cap().get()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_cache_never_hits() {
        let mut cache = RecordCache::new(0);
        cache.put(b"k", b"v");
        assert!(!cache.is_enabled());
        assert_eq!(cache.get(b"k"), None);
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = RecordCache::new(2);
        cache.put(b"a", b"1");
        cache.put(b"b", b"2");
        assert_eq!(cache.get(b"a"), Some(b"1".to_vec())); // a is now most recent
        cache.put(b"c", b"3"); // evicts b

        assert_eq!(cache.get(b"b"), None);
        assert_eq!(cache.get(b"c"), Some(b"3".to_vec()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 2);
        assert_eq!(stats.capacity, 2);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let mut cache = RecordCache::new(8);
        cache.put(b"a", b"1");
        cache.put(b"b", b"2");
        cache.invalidate(b"a");
        assert_eq!(cache.get(b"a"), None);
        cache.clear();
        assert_eq!(cache.get(b"b"), None);
        assert!((cache.stats().hit_rate() - 0.0).abs() < f64::EPSILON);
    }
}
