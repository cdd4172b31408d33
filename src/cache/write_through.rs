//! Write-Through Cache - Fast small tier in front of a larger one
//!
//! Reads try `cache1` first and fall through to `cache2`; a `cache2` hit is
//! copied back into `cache1`. Writes go to both. Entries whose key plus value
//! reach `cache1_size_limit` are kept out of `cache1`.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::interface::{report, Cache, CacheCallback, KeyState};

/// Write-through configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteThroughConfig {
    /// Entries at or above this many bytes skip `cache1`; `None` is unlimited
    pub cache1_size_limit: Option<usize>,
}

/// Two-tier cache with read promotion
pub struct WriteThroughCache {
    cache1: Arc<dyn Cache>,
    cache2: Arc<dyn Cache>,
    config: WriteThroughConfig,
}

fn fits(limit: Option<usize>, key: &str, value: &Bytes) -> bool {
    limit.map_or(true, |limit| key.len() + value.len() < limit)
}

impl WriteThroughCache {
    pub fn new(cache1: Arc<dyn Cache>, cache2: Arc<dyn Cache>) -> Self {
        Self::with_config(cache1, cache2, WriteThroughConfig::default())
    }

    pub fn with_config(cache1: Arc<dyn Cache>, cache2: Arc<dyn Cache>, config: WriteThroughConfig) -> Self {
        Self {
            cache1,
            cache2,
            config,
        }
    }

    pub fn set_cache1_size_limit(&mut self, limit: Option<usize>) {
        self.config.cache1_size_limit = limit;
    }

    pub fn cache1_size_limit(&self) -> Option<usize> {
        self.config.cache1_size_limit
    }
}

struct FirstTierCallback {
    key: String,
    cache1: Arc<dyn Cache>,
    cache2: Arc<dyn Cache>,
    limit: Option<usize>,
    callback: Box<dyn CacheCallback>,
    validated: bool,
}

impl CacheCallback for FirstTierCallback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        self.validated = self.callback.validate_candidate(key, state, value);
        self.validated
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        let this = *self;
        if state == KeyState::Available {
            if this.validated {
                this.callback.done(state, value);
            } else {
                report(this.callback, &this.key, state, value);
            }
            return;
        }

        trace!(key = %this.key, "write-through cache falling back to cache2");
        let second = Box::new(SecondTierCallback {
            key: this.key.clone(),
            cache1: this.cache1,
            limit: this.limit,
            callback: this.callback,
            validated: false,
        });
        this.cache2.get(&this.key, second);
    }
}

struct SecondTierCallback {
    key: String,
    cache1: Arc<dyn Cache>,
    limit: Option<usize>,
    callback: Box<dyn CacheCallback>,
    validated: bool,
}

impl CacheCallback for SecondTierCallback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        self.validated = self.callback.validate_candidate(key, state, value);
        self.validated
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        let this = *self;
        match (state, value) {
            (KeyState::Available, Some(value)) if this.validated => {
                if fits(this.limit, &this.key, &value) {
                    this.cache1.put(&this.key, value.clone());
                }
                this.callback.done(KeyState::Available, Some(value));
            }
            (state, value) => report(this.callback, &this.key, state, value),
        }
    }
}

impl Cache for WriteThroughCache {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        let first = Box::new(FirstTierCallback {
            key: key.to_string(),
            cache1: Arc::clone(&self.cache1),
            cache2: Arc::clone(&self.cache2),
            limit: self.config.cache1_size_limit,
            callback,
            validated: false,
        });
        self.cache1.get(key, first);
    }

    fn put(&self, key: &str, value: Bytes) {
        if fits(self.config.cache1_size_limit, key, &value) {
            self.cache1.put(key, value.clone());
        }
        self.cache2.put(key, value);
    }

    fn delete(&self, key: &str) {
        self.cache1.delete(key);
        self.cache2.delete(key);
    }

    fn name(&self) -> String {
        format!("WriteThrough({},{})", self.cache1.name(), self.cache2.name())
    }

    fn is_blocking(&self) -> bool {
        self.cache1.is_blocking() && self.cache2.is_blocking()
    }

    fn is_healthy(&self) -> bool {
        self.cache1.is_healthy() && self.cache2.is_healthy()
    }

    fn shut_down(&self) {
        self.cache1.shut_down();
        self.cache2.shut_down();
    }
}

// =============================================================================
// Tests
// =============================================================================
