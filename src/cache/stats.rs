//! Cache Stats - Counting wrapper around any cache
//!
//! Records `<prefix>_hits`, `<prefix>_misses`, `<prefix>_inserts` and
//! `<prefix>_deletes` in a [`Statistics`] sink.

use std::sync::Arc;

use bytes::Bytes;

use super::interface::{Cache, CacheCallback, KeyCallback, KeyState};
use crate::stats::{Statistics, Variable};

/// Cache wrapper that counts traffic into named statistics
pub struct CacheStats {
    cache: Arc<dyn Cache>,
    prefix: String,
    hits: Arc<Variable>,
    misses: Arc<Variable>,
    inserts: Arc<Variable>,
    deletes: Arc<Variable>,
}

impl CacheStats {
    pub fn new(prefix: &str, cache: Arc<dyn Cache>, stats: &dyn Statistics) -> Self {
        Self {
            cache,
            prefix: prefix.to_string(),
            hits: stats.add_variable(&format!("{}_hits", prefix)),
            misses: stats.add_variable(&format!("{}_misses", prefix)),
            inserts: stats.add_variable(&format!("{}_inserts", prefix)),
            deletes: stats.add_variable(&format!("{}_deletes", prefix)),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn wrap(&self, callback: Box<dyn CacheCallback>) -> Box<dyn CacheCallback> {
        Box::new(CountingCallback {
            callback,
            hits: Arc::clone(&self.hits),
            misses: Arc::clone(&self.misses),
        })
    }
}

struct CountingCallback {
    callback: Box<dyn CacheCallback>,
    hits: Arc<Variable>,
    misses: Arc<Variable>,
}

impl CacheCallback for CountingCallback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        self.callback.validate_candidate(key, state, value)
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        if state.is_available() {
            self.hits.inc();
        } else {
            self.misses.inc();
        }
        self.callback.done(state, value);
    }
}

impl Cache for CacheStats {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        self.cache.get(key, self.wrap(callback));
    }

    fn multi_get(&self, requests: Vec<KeyCallback>) {
        let wrapped = requests
            .into_iter()
            .map(|r| {
                let callback = self.wrap(r.callback);
                KeyCallback::new(r.key, callback)
            })
            .collect();
        self.cache.multi_get(wrapped);
    }

    fn put(&self, key: &str, value: Bytes) {
        self.inserts.inc();
        self.cache.put(key, value);
    }

    fn delete(&self, key: &str) {
        self.deletes.inc();
        self.cache.delete(key);
    }

    fn name(&self) -> String {
        self.cache.name()
    }

    fn is_blocking(&self) -> bool {
        self.cache.is_blocking()
    }

    fn is_healthy(&self) -> bool {
        self.cache.is_healthy()
    }

    fn shut_down(&self) {
        self.cache.shut_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::interface::blocking_get;
    use crate::cache::lru::LruCache;
    use crate::stats::SimpleStats;

    #[test]
    fn test_counts_traffic() {
        let stats = SimpleStats::new();
        let cache = CacheStats::new("pcache-cohorts-dom", Arc::new(LruCache::new(1000)), &stats);

        cache.put("a", Bytes::from_static(b"1"));
        blocking_get(&cache, "a");
        blocking_get(&cache, "b");
        cache.delete("a");

        assert_eq!(stats.value("pcache-cohorts-dom_hits"), 1);
        assert_eq!(stats.value("pcache-cohorts-dom_misses"), 1);
        assert_eq!(stats.value("pcache-cohorts-dom_inserts"), 1);
        assert_eq!(stats.value("pcache-cohorts-dom_deletes"), 1);
        assert_eq!(cache.name(), "LRUCache(1000)");
    }
}
