//! LRU Cache - In-process bounded backend
//!
//! Byte-bounded least-recently-used cache. Size is accounted as the sum of
//! key and value lengths; inserting past the limit evicts from the cold end.
//!
//! # Design
//!
//! - `lru::LruCache` in unbounded mode provides O(1) recency tracking
//! - Byte accounting and eviction are done here, under one mutex
//! - Callbacks run after the mutex is released

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use lru::LruCache as LruMap;
use parking_lot::Mutex;
use tracing::debug;

use super::interface::{report, Cache, CacheCallback, KeyState};

/// Default capacity (10MB)
pub const DEFAULT_LRU_MAX_BYTES: usize = 10 * 1024 * 1024;

struct LruInner {
    map: LruMap<String, Bytes>,
    size_bytes: usize,
}

/// In-process LRU cache with usage accounting
pub struct LruCache {
    inner: Mutex<LruInner>,
    max_bytes: usize,
    healthy: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    identical_reinserts: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
}

impl LruCache {
    /// Create an LRU cache holding at most `max_bytes` of keys plus values
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: LruMap::unbounded(),
                size_bytes: 0,
            }),
            max_bytes,
            healthy: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            identical_reinserts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn entry_size(key: &str, value: &Bytes) -> usize {
        key.len() + value.len()
    }

    /// Look up a value without invoking a callback; refreshes recency
    pub fn lookup(&self, key: &str) -> Option<Bytes> {
        let found = self.inner.lock().map.get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Insert a value directly
    pub fn insert(&self, key: &str, value: Bytes) {
        let size = Self::entry_size(key, &value);
        let mut inner = self.inner.lock();
        if size > self.max_bytes {
            // The previous value is no longer current.
            if let Some(old) = inner.map.pop(key) {
                inner.size_bytes -= Self::entry_size(key, &old);
            }
            debug!(key, size, max_bytes = self.max_bytes, "value too large for LRU cache");
            return;
        }

        if let Some(existing) = inner.map.get(key) {
            if *existing == value {
                // get() already moved the entry to the hot end
                self.identical_reinserts.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if let Some(old) = inner.map.put(key.to_string(), value) {
            inner.size_bytes -= Self::entry_size(key, &old);
        }
        inner.size_bytes += size;
        self.inserts.fetch_add(1, Ordering::Relaxed);

        while inner.size_bytes > self.max_bytes {
            match inner.map.pop_lru() {
                Some((old_key, old_value)) => {
                    inner.size_bytes -= Self::entry_size(&old_key, &old_value);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    /// Remove a value directly, returning it
    pub fn remove(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let removed = inner.map.pop(key);
        if let Some(value) = &removed {
            inner.size_bytes -= Self::entry_size(key, value);
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Whether `key` is present; does not affect recency or counters
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().map.contains(key)
    }

    /// Total bytes of keys plus values held
    pub fn size_bytes(&self) -> usize {
        self.inner.lock().size_bytes
    }

    /// Configured byte limit
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Number of entries held
    pub fn num_elements(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn num_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn num_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn num_inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    pub fn num_identical_reinserts(&self) -> u64 {
        self.identical_reinserts.load(Ordering::Relaxed)
    }

    pub fn num_deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn num_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Number of lookups served, hit or miss
    pub fn num_gets(&self) -> u64 {
        self.num_hits() + self.num_misses()
    }

    /// Reset all counters
    pub fn clear_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.inserts.store(0, Ordering::Relaxed);
        self.identical_reinserts.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.size_bytes = 0;
    }

    /// Recompute the byte total and compare it with the running count
    pub fn sanity_check(&self) -> bool {
        let inner = self.inner.lock();
        let computed: usize = inner
            .map
            .iter()
            .map(|(k, v)| Self::entry_size(k, v))
            .sum();
        computed == inner.size_bytes && inner.size_bytes <= self.max_bytes
    }

    /// Get cache statistics
    pub fn stats(&self) -> LruStats {
        let hits = self.num_hits();
        let total = hits + self.num_misses();
        LruStats {
            size_bytes: self.size_bytes(),
            max_bytes: self.max_bytes,
            entries: self.num_elements(),
            hits,
            misses: self.num_misses(),
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            inserts: self.num_inserts(),
            evictions: self.num_evictions(),
        }
    }
}

impl Cache for LruCache {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        if !self.is_healthy() {
            report(callback, key, KeyState::NotFound, None);
            return;
        }
        match self.lookup(key) {
            Some(value) => report(callback, key, KeyState::Available, Some(value)),
            None => report(callback, key, KeyState::NotFound, None),
        }
    }

    fn put(&self, key: &str, value: Bytes) {
        if self.is_healthy() {
            self.insert(key, value);
        }
    }

    fn delete(&self, key: &str) {
        if self.is_healthy() {
            self.remove(key);
        }
    }

    fn name(&self) -> String {
        format!("LRUCache({})", self.max_bytes)
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn shut_down(&self) {
        self.healthy.store(false, Ordering::Release);
    }
}

/// LRU cache statistics
#[derive(Debug, Clone)]
pub struct LruStats {
    /// Current size in bytes
    pub size_bytes: usize,
    /// Capacity in bytes
    pub max_bytes: usize,
    /// Number of entries
    pub entries: usize,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    /// Insert count
    pub inserts: u64,
    /// Eviction count
    pub evictions: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::interface::blocking_get;

    fn put(cache: &LruCache, key: &str, value: &str) {
        cache.put(key, Bytes::copy_from_slice(value.as_bytes()));
    }

    fn get(cache: &LruCache, key: &str) -> Option<String> {
        let (state, value) = blocking_get(cache, key);
        match state {
            KeyState::Available => value.map(|v| String::from_utf8(v.to_vec()).unwrap()),
            _ => None,
        }
    }

    #[test]
    fn test_put_get_delete() {
        let cache = LruCache::new(100);
        assert_eq!(cache.size_bytes(), 0);
        assert_eq!(cache.num_elements(), 0);

        put(&cache, "Name", "Value");
        assert_eq!(get(&cache, "Name").as_deref(), Some("Value"));
        assert_eq!(cache.size_bytes(), 9);
        assert_eq!(cache.num_elements(), 1);
        assert_eq!(get(&cache, "Another Name"), None);

        put(&cache, "Name", "NewValue");
        assert_eq!(get(&cache, "Name").as_deref(), Some("NewValue"));
        assert_eq!(cache.size_bytes(), 12);
        assert_eq!(cache.num_elements(), 1);

        cache.delete("Name");
        assert!(cache.sanity_check());
        assert_eq!(get(&cache, "Name"), None);
        assert_eq!(cache.size_bytes(), 0);
        assert_eq!(cache.num_elements(), 0);
        assert_eq!(cache.num_deletes(), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        // Each entry is "kN" + 8 bytes = 10 bytes; room for 3
        let cache = LruCache::new(30);
        put(&cache, "k1", "11111111");
        put(&cache, "k2", "22222222");
        put(&cache, "k3", "33333333");

        // Touch k1 so k2 becomes the coldest
        assert!(get(&cache, "k1").is_some());
        put(&cache, "k4", "44444444");

        assert!(cache.contains("k1"));
        assert!(!cache.contains("k2"));
        assert!(cache.contains("k3"));
        assert!(cache.contains("k4"));
        assert_eq!(cache.num_evictions(), 1);
        assert_eq!(cache.size_bytes(), 30);
        assert!(cache.sanity_check());
    }

    #[test]
    fn test_identical_reinsert_refreshes_recency() {
        let cache = LruCache::new(30);
        put(&cache, "k1", "11111111");
        put(&cache, "k2", "22222222");
        put(&cache, "k3", "33333333");

        put(&cache, "k1", "11111111");
        assert_eq!(cache.num_identical_reinserts(), 1);
        assert_eq!(cache.num_inserts(), 3);

        put(&cache, "k4", "44444444");
        assert!(cache.contains("k1"));
        assert!(!cache.contains("k2"));
    }

    #[test]
    fn test_oversized_value_rejected() {
        let cache = LruCache::new(10);
        put(&cache, "key", "this value is far too long");
        assert_eq!(cache.num_elements(), 0);
        assert_eq!(cache.num_inserts(), 0);
    }

    #[test]
    fn test_oversized_replacement_drops_old_value() {
        let cache = LruCache::new(20);
        put(&cache, "k", "old");
        put(&cache, "other", "v");
        put(&cache, "k", &"x".repeat(100));

        assert_eq!(get(&cache, "k"), None);
        assert_eq!(get(&cache, "other").as_deref(), Some("v"));
        assert_eq!(cache.num_elements(), 1);
        assert_eq!(cache.size_bytes(), 6);
        assert!(cache.sanity_check());
    }

    #[test]
    fn test_hit_miss_counters() {
        let cache = LruCache::new(100);
        put(&cache, "a", "1");
        get(&cache, "a");
        get(&cache, "b");
        get(&cache, "a");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(cache.num_gets(), 3);

        cache.clear_stats();
        assert_eq!(cache.num_gets(), 0);
    }

    #[test]
    fn test_shutdown_fails_fast() {
        let cache = LruCache::new(100);
        put(&cache, "a", "1");
        cache.shut_down();
        assert!(!cache.is_healthy());
        assert_eq!(get(&cache, "a"), None);

        put(&cache, "b", "2");
        assert!(!cache.contains("b"));
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(LruCache::new(1024 * 1024));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("obj-{}-{}", t, i);
                        cache.put(&key, Bytes::from(vec![i as u8; 16]));
                        assert!(cache.lookup(&key).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.num_elements(), 1600);
        assert!(cache.sanity_check());
    }
}
