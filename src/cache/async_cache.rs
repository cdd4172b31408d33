//! Async Cache - Runs a blocking backend on the tokio blocking pool
//!
//! Lookups are handed to `spawn_blocking` on a runtime [`Handle`] so that
//! callers never block on the underlying backend. A [`Semaphore`] bounds the
//! outstanding lookups at `max_parallel`; any get arriving past that limit
//! reports not-found immediately and is counted as dropped.
//!
//! A lookup unit (one get, or a whole multi-get) holds one permit until the
//! backend returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::interface::{report_not_found, Cache, CacheCallback, KeyCallback};
use crate::stats::{Statistics, Variable};

/// Statistic counting gets dropped for saturation or shutdown
pub const ASYNC_CACHE_DROPPED_GETS: &str = "async_cache_dropped_gets";

/// Default bound on outstanding lookups
pub const DEFAULT_MAX_PARALLEL: usize = 100;

/// Lookups owned by a spawned task.
///
/// Dropping it without taking the requests, e.g. because the runtime refused
/// or cancelled the task, reports them as not-found.
struct PendingLookup {
    requests: Option<Vec<KeyCallback>>,
    dropped_gets: Arc<Variable>,
    _permit: OwnedSemaphorePermit,
}

impl PendingLookup {
    fn take(&mut self) -> Vec<KeyCallback> {
        self.requests.take().unwrap_or_default()
    }
}

impl Drop for PendingLookup {
    fn drop(&mut self) {
        if let Some(requests) = self.requests.take() {
            self.dropped_gets.add(requests.len() as i64);
            for request in requests {
                debug!(key = %request.key, "async cache abandoning get");
                report_not_found(request.callback);
            }
        }
    }
}

/// Runs a blocking cache's operations off the caller's thread
pub struct AsyncCache {
    cache: Arc<dyn Cache>,
    runtime: Handle,
    max_parallel: usize,
    semaphore: Arc<Semaphore>,
    stopped: Arc<AtomicBool>,
    dropped_gets: Arc<Variable>,
}

impl AsyncCache {
    pub fn new(cache: Arc<dyn Cache>, runtime: Handle, max_parallel: usize, stats: &dyn Statistics) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            cache,
            runtime,
            max_parallel,
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            stopped: Arc::new(AtomicBool::new(false)),
            dropped_gets: stats.add_variable(ASYNC_CACHE_DROPPED_GETS),
        }
    }

    /// Lookups dispatched to the runtime that have not yet returned
    pub fn outstanding_operations(&self) -> usize {
        self.max_parallel
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    fn drop_requests(&self, requests: Vec<KeyCallback>) {
        self.dropped_gets.add(requests.len() as i64);
        for request in requests {
            debug!(key = %request.key, cache = %self.cache.name(), "async cache dropping get");
            report_not_found(request.callback);
        }
    }

    fn dispatch(&self, requests: Vec<KeyCallback>) {
        if self.stopped.load(Ordering::Acquire) {
            self.drop_requests(requests);
            return;
        }
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.drop_requests(requests);
                return;
            }
        };

        let mut pending = PendingLookup {
            requests: Some(requests),
            dropped_gets: Arc::clone(&self.dropped_gets),
            _permit: permit,
        };
        let cache = Arc::clone(&self.cache);
        let stopped = Arc::clone(&self.stopped);
        self.runtime.spawn_blocking(move || {
            if stopped.load(Ordering::Acquire) {
                return;
            }
            let mut requests = pending.take();
            if requests.len() == 1 {
                if let Some(request) = requests.pop() {
                    cache.get(&request.key, request.callback);
                }
            } else {
                cache.multi_get(requests);
            }
        });
    }

    fn spawn_write<F>(&self, op: F)
    where
        F: FnOnce(&dyn Cache) + Send + 'static,
    {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let cache = Arc::clone(&self.cache);
        self.runtime.spawn_blocking(move || op(cache.as_ref()));
    }
}

impl Cache for AsyncCache {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        self.dispatch(vec![KeyCallback::new(key, callback)]);
    }

    fn multi_get(&self, requests: Vec<KeyCallback>) {
        if requests.is_empty() {
            return;
        }
        self.dispatch(requests);
    }

    fn put(&self, key: &str, value: Bytes) {
        let key = key.to_string();
        self.spawn_write(move |cache| cache.put(&key, value));
    }

    fn delete(&self, key: &str) {
        let key = key.to_string();
        self.spawn_write(move |cache| cache.delete(&key));
    }

    fn name(&self) -> String {
        format!("Async({})", self.cache.name())
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn is_healthy(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && self.cache.is_healthy()
    }

    fn shut_down(&self) {
        self.stopped.store(true, Ordering::Release);
        self.semaphore.close();
        self.cache.shut_down();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::interface::{blocking_get, callback_fn, KeyState};
    use crate::cache::lru::LruCache;
    use crate::stats::SimpleStats;
    use std::time::{Duration, Instant};
    use tokio::runtime::Runtime;

    /// Backend whose gets block until the test opens the gate
    struct GatedCache {
        inner: LruCache,
        gate: crossbeam::channel::Receiver<()>,
    }

    impl Cache for GatedCache {
        fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
            let _ = self.gate.recv();
            self.inner.get(key, callback);
        }
        fn put(&self, key: &str, value: Bytes) {
            self.inner.put(key, value);
        }
        fn delete(&self, key: &str) {
            self.inner.delete(key);
        }
        fn name(&self) -> String {
            "Gated".to_string()
        }
        fn is_blocking(&self) -> bool {
            true
        }
        fn is_healthy(&self) -> bool {
            true
        }
        fn shut_down(&self) {}
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_put_runs_on_blocking_pool() {
        let rt = Runtime::new().unwrap();
        let stats = SimpleStats::new();
        let lru = Arc::new(LruCache::new(1000));
        let cache = AsyncCache::new(lru.clone(), rt.handle().clone(), 10, &stats);

        cache.put("k", Bytes::from_static(b"v"));
        assert!(wait_for(|| lru.contains("k")));
        cache.delete("k");
        assert!(wait_for(|| !lru.contains("k")));
        assert_eq!(cache.name(), "Async(LRUCache(1000))");
        assert!(!cache.is_blocking());
    }

    #[test]
    fn test_lookup_delivered_off_caller_thread() {
        let rt = Runtime::new().unwrap();
        let stats = SimpleStats::new();
        let lru = Arc::new(LruCache::new(1000));
        lru.put("k", Bytes::from_static(b"v"));
        let cache = AsyncCache::new(lru, rt.handle().clone(), 10, &stats);

        let (state, value) = blocking_get(&cache, "k");
        assert_eq!(state, KeyState::Available);
        assert_eq!(value.unwrap().as_ref(), b"v");
        assert_eq!(blocking_get(&cache, "missing").0, KeyState::NotFound);
        assert!(wait_for(|| cache.outstanding_operations() == 0));
    }

    #[test]
    fn test_saturation_drops_gets() {
        let rt = Runtime::new().unwrap();
        let stats = SimpleStats::new();
        let (open, gate) = crossbeam::channel::unbounded();
        let backend = Arc::new(GatedCache {
            inner: LruCache::new(1000),
            gate,
        });
        let cache = AsyncCache::new(backend, rt.handle().clone(), 2, &stats);

        let (tx, rx) = crossbeam::channel::unbounded();
        for i in 0..4 {
            let tx = tx.clone();
            cache.get(
                &format!("k{}", i),
                callback_fn(move |state, _| tx.send((i, state)).unwrap()),
            );
        }
        assert_eq!(cache.outstanding_operations(), 2);

        // Two were dropped synchronously
        let mut early: Vec<_> = rx.try_iter().collect();
        early.sort_by_key(|(i, _)| *i);
        assert_eq!(early, vec![(2, KeyState::NotFound), (3, KeyState::NotFound)]);
        assert_eq!(stats.value(ASYNC_CACHE_DROPPED_GETS), 2);

        open.send(()).unwrap();
        open.send(()).unwrap();
        for _ in 0..2 {
            let (_, state) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(state, KeyState::NotFound);
        }
        assert!(wait_for(|| cache.outstanding_operations() == 0));
    }

    #[test]
    fn test_shutdown_fails_fast() {
        let rt = Runtime::new().unwrap();
        let stats = SimpleStats::new();
        let lru = Arc::new(LruCache::new(1000));
        let cache = AsyncCache::new(lru.clone(), rt.handle().clone(), 10, &stats);

        cache.shut_down();
        assert!(!cache.is_healthy());
        assert!(!lru.is_healthy());
        assert_eq!(blocking_get(&cache, "k").0, KeyState::NotFound);
        assert_eq!(stats.value(ASYNC_CACHE_DROPPED_GETS), 1);
        assert_eq!(cache.outstanding_operations(), 0);
    }

    #[test]
    fn test_unrun_lookup_reports_not_found() {
        let stats = SimpleStats::new();
        let semaphore = Arc::new(Semaphore::new(1));
        let (tx, rx) = crossbeam::channel::unbounded();
        let pending = PendingLookup {
            requests: Some(vec![KeyCallback::new(
                "k",
                callback_fn(move |state, _| tx.send(state).unwrap()),
            )]),
            dropped_gets: stats.add_variable(ASYNC_CACHE_DROPPED_GETS),
            _permit: semaphore.clone().try_acquire_owned().unwrap(),
        };
        assert_eq!(semaphore.available_permits(), 0);

        drop(pending);
        assert_eq!(rx.try_recv().unwrap(), KeyState::NotFound);
        assert_eq!(stats.value(ASYNC_CACHE_DROPPED_GETS), 1);
        assert_eq!(semaphore.available_permits(), 1);
    }
}
