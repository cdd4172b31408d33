//! Property Stores
//!
//! A [`PropertyStore`] reads cohorts into a page and persists them. Reads
//! return a [`PropertyStoreGetCallback`] handle that can cut the lookup short
//! and must be released exactly once.
//!
//! [`CachePropertyStore`] maps each cohort onto one key of a [`Cache`]:
//!
//! ```text
//! <prefix><url>@<options-signature><cache-key-suffix>@<cohort>
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use tracing::{debug, trace, warn};

use super::cache::PropertyCache;
use super::cohort::Cohort;
use super::page::PropertyPage;
use super::value::PropertyCacheValues;
use crate::cache::{Cache, CacheCallback, CacheStats, KeyState};
use crate::stats::{Statistics, Variable};

/// Completion callback for store operations; receives success
pub type StoreDone = Box<dyn FnOnce(bool) + Send>;

/// Default key prefix for cohort entries
pub const DEFAULT_KEY_PREFIX: &str = "prop_page/";

/// Statistic counting stored cohorts that failed to decode
pub const CORRUPT_PAYLOADS: &str = "pcache_get_callback_corrupt_payloads";

/// Statistic counting lookups completed early by fast-finish
pub const FAST_FINISHED: &str = "pcache_get_callback_fast_finished";

/// Handle to an in-flight property store lookup
pub trait PropertyStoreGetCallback: Send + Sync {
    /// Complete the lookup with whatever cohorts have arrived.
    ///
    /// Idempotent and non-blocking. Ignored when the store has cancellation
    /// disabled.
    fn fast_finish_lookup(&self);

    /// Release the handle. Must be called exactly once; outstanding work
    /// still runs to completion.
    fn delete_when_done(&self);
}

/// Cohort-addressed persistent storage for property pages
pub trait PropertyStore: Send + Sync {
    /// Read `cohorts` into `page`, calling `done` exactly once.
    ///
    /// Returns a handle unless the lookup completed before returning.
    fn get(
        &self,
        url: &str,
        options_signature: &str,
        cache_key_suffix: &str,
        cohorts: &[Cohort],
        page: &Arc<PropertyPage>,
        done: StoreDone,
    ) -> Option<Arc<dyn PropertyStoreGetCallback>>;

    /// Persist one cohort. An empty `values` removes the stored cohort.
    fn put(
        &self,
        url: &str,
        options_signature: &str,
        cache_key_suffix: &str,
        cohort: &Cohort,
        values: &PropertyCacheValues,
        done: Option<StoreDone>,
    );

    fn set_enable_get_cancellation(&self, enabled: bool);

    fn enable_get_cancellation(&self) -> bool;

    fn name(&self) -> String;
}

// =============================================================================
// Get callback state machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Pending,
    Hit,
    Miss,
}

struct GetState {
    slots: Vec<SlotState>,
    pending: usize,
    success: bool,
    done: Option<StoreDone>,
    done_called: bool,
    delete_when_done: bool,
    page: Option<Weak<PropertyPage>>,
}

/// Tracks the per-cohort lookups of one [`CachePropertyStore::get`]
pub struct CachePropertyStoreGetCallback {
    url: String,
    cohorts: Vec<Cohort>,
    enable_cancellation: bool,
    state: Mutex<GetState>,
    corrupt_payloads: Arc<Variable>,
    fast_finished: Arc<Variable>,
}

impl CachePropertyStoreGetCallback {
    fn new(
        url: &str,
        cohorts: &[Cohort],
        page: &Arc<PropertyPage>,
        done: StoreDone,
        enable_cancellation: bool,
        corrupt_payloads: Arc<Variable>,
        fast_finished: Arc<Variable>,
    ) -> Self {
        Self {
            url: url.to_string(),
            cohorts: cohorts.to_vec(),
            enable_cancellation,
            state: Mutex::new(GetState {
                slots: vec![SlotState::Pending; cohorts.len()],
                pending: cohorts.len(),
                success: false,
                done: Some(done),
                done_called: false,
                delete_when_done: false,
                page: Some(Arc::downgrade(page)),
            }),
            corrupt_payloads,
            fast_finished,
        }
    }

    fn page(&self) -> Option<Arc<PropertyPage>> {
        self.state.lock().page.as_ref().and_then(Weak::upgrade)
    }

    /// Decode a candidate payload and check it against the page's validator
    fn decode_candidate(&self, index: usize, payload: &Bytes) -> Option<PropertyCacheValues> {
        let cohort = &self.cohorts[index];
        let values = match PropertyCacheValues::decode(payload.as_ref()) {
            Ok(values) => values,
            Err(e) => {
                self.corrupt_payloads.inc();
                warn!(url = %self.url, cohort = %cohort, error = %e, "unparseable property cache payload");
                return None;
            }
        };
        let page = self.page()?;
        if values.value.iter().all(|v| page.is_cache_valid(v.write_timestamp_ms)) {
            Some(values)
        } else {
            debug!(url = %self.url, cohort = %cohort, "stored cohort rejected by page validator");
            None
        }
    }

    /// One cohort's backend lookup finished.
    ///
    /// The page is upgraded before the state lock is taken and released only
    /// after the lock is dropped: if the consumer drops the page meanwhile,
    /// this reference is the last one and the page's drop re-enters
    /// `delete_when_done`.
    fn cohort_done(&self, index: usize, state: KeyState, values: Option<PropertyCacheValues>) {
        let page = self.page();
        let done = {
            let mut guard = self.state.lock();
            if guard.slots[index] != SlotState::Pending {
                trace!(url = %self.url, cohort = %self.cohorts[index], "discarding late cohort result");
                return;
            }

            let cohort = &self.cohorts[index];
            let hit = match (state, values, page.as_ref()) {
                (KeyState::Available, Some(values), Some(page)) => {
                    for value in &values.value {
                        page.add_value_from_protobuf(cohort, value);
                    }
                    true
                }
                _ => false,
            };
            if let Some(page) = page.as_ref() {
                page.set_cache_state(cohort, if hit { KeyState::Available } else { state_for_miss(state) });
            }

            guard.slots[index] = if hit { SlotState::Hit } else { SlotState::Miss };
            guard.success |= hit;
            guard.pending -= 1;
            if guard.pending > 0 {
                return;
            }
            self.finish_locked(&mut guard)
        };
        if let Some((done, success)) = done {
            done(success);
        }
        drop(page);
    }

    fn finish_locked(&self, state: &mut GetState) -> Option<(StoreDone, bool)> {
        if state.done_called {
            return None;
        }
        state.done_called = true;
        if state.delete_when_done {
            state.page = None;
        }
        let success = state.success;
        state.done.take().map(|done| (done, success))
    }
}

fn state_for_miss(state: KeyState) -> KeyState {
    match state {
        KeyState::NetworkError => KeyState::NetworkError,
        _ => KeyState::NotFound,
    }
}

impl PropertyStoreGetCallback for CachePropertyStoreGetCallback {
    fn fast_finish_lookup(&self) {
        if !self.enable_cancellation {
            return;
        }
        let done = {
            let mut state = self.state.lock();
            if state.done_called {
                return;
            }
            for slot in state.slots.iter_mut() {
                if *slot == SlotState::Pending {
                    *slot = SlotState::Miss;
                }
            }
            state.pending = 0;
            self.finish_locked(&mut state)
        };
        if let Some((done, success)) = done {
            self.fast_finished.inc();
            debug!(url = %self.url, success, "property store lookup fast-finished");
            done(success);
        }
    }

    fn delete_when_done(&self) {
        let mut state = self.state.lock();
        assert!(!state.delete_when_done, "delete_when_done called twice for {}", self.url);
        state.delete_when_done = true;
        if state.done_called {
            state.page = None;
        }
    }
}

/// Cache callback for a single cohort key
struct CohortLookup {
    parent: Arc<CachePropertyStoreGetCallback>,
    index: usize,
    decoded: Option<PropertyCacheValues>,
}

impl CacheCallback for CohortLookup {
    fn validate_candidate(&mut self, _key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        if !state.is_available() {
            return true;
        }
        self.decoded = value.and_then(|payload| self.parent.decode_candidate(self.index, payload));
        self.decoded.is_some()
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        let CohortLookup {
            parent,
            index,
            decoded,
        } = *self;
        let values = match (state, decoded, value) {
            (KeyState::Available, Some(values), _) => Some(values),
            (KeyState::Available, None, Some(payload)) => parent.decode_candidate(index, &payload),
            _ => None,
        };
        parent.cohort_done(index, state, values);
    }
}

// =============================================================================
// Cache-backed store
// =============================================================================

/// Property store over a key/value [`Cache`], one key per cohort
pub struct CachePropertyStore {
    prefix: String,
    default_cache: Arc<dyn Cache>,
    cohort_caches: HashMap<String, Arc<dyn Cache>>,
    stats: Arc<dyn Statistics>,
    enable_get_cancellation: AtomicBool,
    corrupt_payloads: Arc<Variable>,
    fast_finished: Arc<Variable>,
}

impl CachePropertyStore {
    pub fn new(prefix: impl Into<String>, cache: Arc<dyn Cache>, stats: Arc<dyn Statistics>) -> Self {
        let corrupt_payloads = stats.add_variable(CORRUPT_PAYLOADS);
        let fast_finished = stats.add_variable(FAST_FINISHED);
        Self {
            prefix: prefix.into(),
            default_cache: cache,
            cohort_caches: HashMap::new(),
            stats,
            enable_get_cancellation: AtomicBool::new(false),
            corrupt_payloads,
            fast_finished,
        }
    }

    /// Route `cohort` to the default cache, counting its traffic
    pub fn add_cohort(&mut self, cohort: &str) {
        let cache = Arc::clone(&self.default_cache);
        self.add_cohort_with_cache(cohort, cache);
    }

    /// Route `cohort` to `cache`, counting its traffic
    pub fn add_cohort_with_cache(&mut self, cohort: &str, cache: Arc<dyn Cache>) {
        assert!(
            !self.cohort_caches.contains_key(cohort),
            "cohort {} is added twice to the property store",
            cohort
        );
        let prefix = PropertyCache::get_stats_prefix(cohort);
        let counted: Arc<dyn Cache> = Arc::new(CacheStats::new(&prefix, cache, self.stats.as_ref()));
        self.cohort_caches.insert(cohort.to_string(), counted);
    }

    /// Cache key holding one cohort of one page
    pub fn cache_key(&self, url: &str, options_signature: &str, cache_key_suffix: &str, cohort: &Cohort) -> String {
        format!(
            "{}{}@{}{}@{}",
            self.prefix,
            url,
            options_signature,
            cache_key_suffix,
            cohort.name()
        )
    }

    pub fn key_prefix(&self) -> &str {
        &self.prefix
    }

    fn cache_for(&self, cohort: &Cohort) -> &Arc<dyn Cache> {
        self.cohort_caches
            .get(cohort.name())
            .unwrap_or(&self.default_cache)
    }
}

impl PropertyStore for CachePropertyStore {
    fn get(
        &self,
        url: &str,
        options_signature: &str,
        cache_key_suffix: &str,
        cohorts: &[Cohort],
        page: &Arc<PropertyPage>,
        done: StoreDone,
    ) -> Option<Arc<dyn PropertyStoreGetCallback>> {
        if cohorts.is_empty() {
            done(false);
            return None;
        }

        let callback = Arc::new(CachePropertyStoreGetCallback::new(
            url,
            cohorts,
            page,
            done,
            self.enable_get_cancellation(),
            Arc::clone(&self.corrupt_payloads),
            Arc::clone(&self.fast_finished),
        ));
        for (index, cohort) in cohorts.iter().enumerate() {
            let key = self.cache_key(url, options_signature, cache_key_suffix, cohort);
            trace!(key = %key, "property store lookup");
            self.cache_for(cohort).get(
                &key,
                Box::new(CohortLookup {
                    parent: Arc::clone(&callback),
                    index,
                    decoded: None,
                }),
            );
        }
        Some(callback)
    }

    fn put(
        &self,
        url: &str,
        options_signature: &str,
        cache_key_suffix: &str,
        cohort: &Cohort,
        values: &PropertyCacheValues,
        done: Option<StoreDone>,
    ) {
        let key = self.cache_key(url, options_signature, cache_key_suffix, cohort);
        let cache = self.cache_for(cohort);
        if values.value.is_empty() {
            debug!(key = %key, "removing empty cohort");
            cache.delete(&key);
        } else {
            cache.put(&key, Bytes::from(values.encode_to_vec()));
        }
        if let Some(done) = done {
            done(true);
        }
    }

    fn set_enable_get_cancellation(&self, enabled: bool) {
        self.enable_get_cancellation.store(enabled, Ordering::Release);
    }

    fn enable_get_cancellation(&self) -> bool {
        self.enable_get_cancellation.load(Ordering::Acquire)
    }

    fn name(&self) -> String {
        format!("CachePropertyStore({})", self.default_cache.name())
    }
}

// =============================================================================
// Tests
// =============================================================================
