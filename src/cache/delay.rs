//! Delay Cache - Test helper that holds lookups for chosen keys
//!
//! Gets for a delayed key are parked until [`DelayCache::release_key`] is
//! called, at which point they are forwarded to the wrapped cache on the
//! releasing thread. Other keys pass straight through.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use super::interface::{Cache, CacheCallback, KeyCallback};

#[derive(Default)]
struct DelayState {
    delayed: HashSet<String>,
    parked: HashMap<String, Vec<Box<dyn CacheCallback>>>,
}

/// Cache wrapper that can hold lookups until released
pub struct DelayCache {
    cache: Arc<dyn Cache>,
    state: Mutex<DelayState>,
}

impl DelayCache {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            state: Mutex::new(DelayState::default()),
        }
    }

    /// Hold future gets for `key`
    pub fn delay_key(&self, key: &str) {
        self.state.lock().delayed.insert(key.to_string());
    }

    /// Stop delaying `key` and complete any gets parked on it
    pub fn release_key(&self, key: &str) {
        let parked = {
            let mut state = self.state.lock();
            state.delayed.remove(key);
            state.parked.remove(key).unwrap_or_default()
        };
        trace!(key, count = parked.len(), "delay cache releasing key");
        for callback in parked {
            self.cache.get(key, callback);
        }
    }

    /// Release every delayed key
    pub fn release_all(&self) {
        let keys: Vec<String> = self.state.lock().delayed.iter().cloned().collect();
        for key in keys {
            self.release_key(&key);
        }
    }

    /// Gets currently parked on `key`
    pub fn num_parked(&self, key: &str) -> usize {
        self.state.lock().parked.get(key).map_or(0, Vec::len)
    }
}

impl Cache for DelayCache {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        {
            let mut state = self.state.lock();
            if state.delayed.contains(key) {
                state.parked.entry(key.to_string()).or_default().push(callback);
                return;
            }
        }
        self.cache.get(key, callback);
    }

    fn multi_get(&self, requests: Vec<KeyCallback>) {
        for request in requests {
            self.get(&request.key, request.callback);
        }
    }

    fn put(&self, key: &str, value: Bytes) {
        self.cache.put(key, value);
    }

    fn delete(&self, key: &str) {
        self.cache.delete(key);
    }

    fn name(&self) -> String {
        format!("DelayCache({})", self.cache.name())
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn is_healthy(&self) -> bool {
        self.cache.is_healthy()
    }

    fn shut_down(&self) {
        self.cache.shut_down();
    }
}
