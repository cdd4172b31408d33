//! Cache Batcher - Coalesces lookups into multi-gets
//!
//! Sits in front of an asynchronous backend. Up to `max_parallel_lookups`
//! requests are outstanding at once; anything beyond that waits in a queue
//! and is flushed as a single `multi_get` when an outstanding request
//! finishes. A multi-get counts as one outstanding request.
//!
//! When the queue is full, new gets report not-found immediately.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::interface::{report_not_found, Cache, CacheCallback, KeyCallback, KeyState};
use crate::stats::{Statistics, Variable};

/// Statistic counting gets dropped because the queue was full
pub const CACHE_BATCHER_DROPPED_GETS: &str = "cache_batcher_dropped_gets";

/// Statistic counting multi-gets issued from the queue
pub const CACHE_BATCHER_BATCHES: &str = "cache_batcher_batches";

/// Batcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Outstanding backend requests allowed at once
    pub max_parallel_lookups: usize,
    /// Queued gets held before new ones are dropped
    pub max_queue_size: usize,
    /// Largest number of keys sent in one multi-get
    pub max_batch_size: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_parallel_lookups: 1,
            max_queue_size: 1000,
            max_batch_size: 1000,
        }
    }
}

#[derive(Default)]
struct BatcherState {
    queue: Vec<KeyCallback>,
    in_flight: usize,
    last_batch_size: usize,
}

struct BatcherInner {
    cache: Arc<dyn Cache>,
    config: BatcherConfig,
    state: Mutex<BatcherState>,
    dropped_gets: Arc<Variable>,
    batches: Arc<Variable>,
}

/// Queueing, batching front end for an asynchronous cache
pub struct CacheBatcher {
    inner: Arc<BatcherInner>,
}

impl CacheBatcher {
    /// Create a batcher with default limits
    pub fn new(cache: Arc<dyn Cache>, stats: &dyn Statistics) -> Self {
        Self::with_config(cache, stats, BatcherConfig::default())
    }

    /// Create a batcher with explicit limits
    pub fn with_config(cache: Arc<dyn Cache>, stats: &dyn Statistics, config: BatcherConfig) -> Self {
        let config = BatcherConfig {
            max_parallel_lookups: config.max_parallel_lookups.max(1),
            max_batch_size: config.max_batch_size.max(1),
            ..config
        };
        Self {
            inner: Arc::new(BatcherInner {
                cache,
                config,
                state: Mutex::new(BatcherState::default()),
                dropped_gets: stats.add_variable(CACHE_BATCHER_DROPPED_GETS),
                batches: stats.add_variable(CACHE_BATCHER_BATCHES),
            }),
        }
    }

    /// Outstanding requests against the backend
    pub fn num_in_flight(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    /// Gets waiting for a batch
    pub fn num_queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Number of keys in the most recently issued batch
    pub fn last_batch_size(&self) -> usize {
        self.inner.state.lock().last_batch_size
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.inner.config
    }
}

impl BatcherInner {
    /// One outstanding request finished; flush the queue if there is room
    fn on_complete(self: &Arc<Self>) {
        let batch = {
            let mut state = self.state.lock();
            state.in_flight -= 1;
            if state.queue.is_empty() || state.in_flight >= self.config.max_parallel_lookups {
                return;
            }
            let n = state.queue.len().min(self.config.max_batch_size);
            let batch: Vec<KeyCallback> = state.queue.drain(..n).collect();
            state.in_flight += 1;
            state.last_batch_size = n;
            batch
        };

        self.batches.inc();
        trace!(size = batch.len(), "cache batcher issuing batch");
        let remaining = Arc::new(AtomicUsize::new(batch.len()));
        let requests = batch
            .into_iter()
            .map(|request| {
                let callback: Box<dyn CacheCallback> = Box::new(BatcherCallback {
                    batcher: Arc::clone(self),
                    callback: request.callback,
                    group: Some(Arc::clone(&remaining)),
                });
                KeyCallback::new(request.key, callback)
            })
            .collect();
        self.cache.multi_get(requests);
    }
}

struct BatcherCallback {
    batcher: Arc<BatcherInner>,
    callback: Box<dyn CacheCallback>,
    /// Keys of the same multi-get not yet completed
    group: Option<Arc<AtomicUsize>>,
}

impl CacheCallback for BatcherCallback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        self.callback.validate_candidate(key, state, value)
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        let BatcherCallback {
            batcher,
            callback,
            group,
        } = *self;
        callback.done(state, value);
        let finished = match group {
            Some(remaining) => remaining.fetch_sub(1, Ordering::AcqRel) == 1,
            None => true,
        };
        if finished {
            batcher.on_complete();
        }
    }
}

impl Cache for CacheBatcher {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        let callback = {
            let mut state = self.inner.state.lock();
            if state.in_flight < self.inner.config.max_parallel_lookups {
                state.in_flight += 1;
                callback
            } else if state.queue.len() < self.inner.config.max_queue_size {
                state.queue.push(KeyCallback::new(key, callback));
                return;
            } else {
                drop(state);
                self.inner.dropped_gets.inc();
                debug!(key, "cache batcher queue full, dropping get");
                report_not_found(callback);
                return;
            }
        };

        let callback = Box::new(BatcherCallback {
            batcher: Arc::clone(&self.inner),
            callback,
            group: None,
        });
        self.inner.cache.get(key, callback);
    }

    fn put(&self, key: &str, value: Bytes) {
        self.inner.cache.put(key, value);
    }

    fn delete(&self, key: &str) {
        self.inner.cache.delete(key);
    }

    fn name(&self) -> String {
        format!("Batcher({})", self.inner.cache.name())
    }

    fn is_blocking(&self) -> bool {
        self.inner.cache.is_blocking()
    }

    fn is_healthy(&self) -> bool {
        self.inner.cache.is_healthy()
    }

    fn shut_down(&self) {
        self.inner.cache.shut_down();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::delay::DelayCache;
    use crate::cache::interface::callback_fn;
    use crate::cache::lru::LruCache;
    use crate::stats::SimpleStats;

    fn collector() -> (
        crossbeam::channel::Sender<(String, KeyState)>,
        crossbeam::channel::Receiver<(String, KeyState)>,
    ) {
        crossbeam::channel::unbounded()
    }

    fn issue(batcher: &CacheBatcher, key: &str, tx: &crossbeam::channel::Sender<(String, KeyState)>) {
        let tx = tx.clone();
        let k = key.to_string();
        batcher.get(key, callback_fn(move |state, _| tx.send((k, state)).unwrap()));
    }

    #[test]
    fn test_sync_backend_passes_through() {
        let stats = SimpleStats::new();
        let lru = Arc::new(LruCache::new(1000));
        lru.put("k", Bytes::from_static(b"v"));
        let batcher = CacheBatcher::new(lru, &stats);

        let (tx, rx) = collector();
        issue(&batcher, "k", &tx);
        issue(&batcher, "missing", &tx);
        assert_eq!(rx.try_recv().unwrap(), ("k".to_string(), KeyState::Available));
        assert_eq!(rx.try_recv().unwrap(), ("missing".to_string(), KeyState::NotFound));
        assert_eq!(batcher.num_in_flight(), 0);
        assert_eq!(stats.value(CACHE_BATCHER_BATCHES), 0);
    }

    #[test]
    fn test_queued_gets_flushed_as_one_batch() {
        let stats = SimpleStats::new();
        let lru = Arc::new(LruCache::new(1000));
        for k in ["a", "b", "c", "d"] {
            lru.put(k, Bytes::from_static(b"v"));
        }
        let delay = Arc::new(DelayCache::new(lru));
        delay.delay_key("a");
        let batcher = CacheBatcher::new(delay.clone(), &stats);

        let (tx, rx) = collector();
        for k in ["a", "b", "c", "d"] {
            issue(&batcher, k, &tx);
        }
        assert_eq!(batcher.num_in_flight(), 1);
        assert_eq!(batcher.num_queued(), 3);
        assert!(rx.try_recv().is_err());

        delay.release_key("a");
        let mut keys: Vec<String> = rx.try_iter().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
        assert_eq!(batcher.last_batch_size(), 3);
        assert_eq!(stats.value(CACHE_BATCHER_BATCHES), 1);
        assert_eq!(batcher.num_in_flight(), 0);
        assert_eq!(batcher.num_queued(), 0);
    }

    #[test]
    fn test_batch_size_cap() {
        let stats = SimpleStats::new();
        let delay = Arc::new(DelayCache::new(Arc::new(LruCache::new(1000))));
        delay.delay_key("first");
        delay.delay_key("q0");
        let config = BatcherConfig {
            max_batch_size: 2,
            ..BatcherConfig::default()
        };
        let batcher = CacheBatcher::with_config(delay.clone(), &stats, config);

        let (tx, rx) = collector();
        issue(&batcher, "first", &tx);
        for i in 0..5 {
            issue(&batcher, &format!("q{}", i), &tx);
        }
        assert_eq!(batcher.num_queued(), 5);

        delay.release_key("first");
        // q0 is delayed, so the first batch (q0, q1) stays open
        assert_eq!(batcher.last_batch_size(), 2);
        assert_eq!(batcher.num_queued(), 3);
        assert_eq!(batcher.num_in_flight(), 1);

        delay.release_key("q0");
        // Remaining three go out as a batch of two and then a batch of one
        assert_eq!(batcher.num_queued(), 0);
        assert_eq!(batcher.last_batch_size(), 1);
        assert_eq!(rx.try_iter().count(), 6);
        assert_eq!(stats.value(CACHE_BATCHER_BATCHES), 3);
    }

    #[test]
    fn test_queue_full_drops() {
        let stats = SimpleStats::new();
        let delay = Arc::new(DelayCache::new(Arc::new(LruCache::new(1000))));
        delay.delay_key("k0");
        let config = BatcherConfig {
            max_parallel_lookups: 1,
            max_queue_size: 2,
            ..BatcherConfig::default()
        };
        let batcher = CacheBatcher::with_config(delay.clone(), &stats, config);

        let (tx, rx) = collector();
        for i in 0..5 {
            issue(&batcher, &format!("k{}", i), &tx);
        }
        let dropped: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            dropped,
            vec![
                ("k3".to_string(), KeyState::NotFound),
                ("k4".to_string(), KeyState::NotFound)
            ]
        );
        assert_eq!(stats.value(CACHE_BATCHER_DROPPED_GETS), 2);
        assert_eq!(batcher.num_in_flight(), 1);
        assert_eq!(batcher.num_queued(), 2);
    }
}
