//! Property Cache - Cohort registry and read entry point
//!
//! Owns the property store, the clock and the set of cohorts. Pages are
//! created against a cache and read through it; writes go from the page
//! straight to the store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::cohort::{Cohort, CohortList};
use super::page::PropertyPage;
use super::store::{PropertyStore, StoreDone};
use super::value::PropertyValue;
use crate::stats::Statistics;
use crate::timer::Timer;

/// Default stability threshold: fewer than 300 changes per 1000 writes
pub const DEFAULT_MUTATIONS_PER_1000_WRITES_THRESHOLD: u32 = 300;

/// State shared between a cache and the pages created from it
pub(crate) struct CacheShared {
    pub(crate) store: Arc<dyn PropertyStore>,
    pub(crate) timer: Arc<dyn Timer>,
    enabled: AtomicBool,
}

impl CacheShared {
    pub(crate) fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// Registry of cohorts over a property store
pub struct PropertyCache {
    shared: Arc<CacheShared>,
    stats: Arc<dyn Statistics>,
    cohorts: BTreeMap<String, Cohort>,
    cohort_list: CohortList,
    mutations_per_1000_writes_threshold: u32,
    reads_started: AtomicBool,
}

impl PropertyCache {
    pub fn new(store: Arc<dyn PropertyStore>, timer: Arc<dyn Timer>, stats: Arc<dyn Statistics>) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                store,
                timer,
                enabled: AtomicBool::new(true),
            }),
            stats,
            cohorts: BTreeMap::new(),
            cohort_list: Vec::new(),
            mutations_per_1000_writes_threshold: DEFAULT_MUTATIONS_PER_1000_WRITES_THRESHOLD,
            reads_started: AtomicBool::new(false),
        }
    }

    /// Statistics prefix for a cohort's cache counters
    pub fn get_stats_prefix(cohort_name: &str) -> String {
        format!("pcache-cohorts-{}", cohort_name)
    }

    /// Create the hit/miss/insert/delete counters for a cohort
    pub fn init_cohort_stats(cohort_name: &str, stats: &dyn Statistics) {
        let prefix = Self::get_stats_prefix(cohort_name);
        for suffix in ["hits", "misses", "inserts", "deletes"] {
            stats.add_variable(&format!("{}_{}", prefix, suffix));
        }
    }

    /// Register a cohort.
    ///
    /// # Panics
    ///
    /// If the name is already registered, or a read has already been issued.
    pub fn add_cohort(&mut self, name: &str) -> Cohort {
        assert!(
            !self.reads_started.load(Ordering::Acquire),
            "cohort {} added after reads started",
            name
        );
        assert!(!self.cohorts.contains_key(name), "cohort {} is added twice", name);
        let cohort = Cohort::new(name);
        Self::init_cohort_stats(name, self.stats.as_ref());
        self.cohorts.insert(name.to_string(), cohort.clone());
        self.cohort_list.push(cohort.clone());
        info!(cohort = name, "registered property cache cohort");
        cohort
    }

    pub fn get_cohort(&self, name: &str) -> Option<Cohort> {
        self.cohorts.get(name).cloned()
    }

    /// Every cohort, in registration order
    pub fn get_all_cohorts(&self) -> &CohortList {
        &self.cohort_list
    }

    /// Read all cohorts into `page`; `done` receives whether any cohort
    /// was found
    pub fn read<F>(&self, page: &Arc<PropertyPage>, done: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.read_with_cohorts(&self.cohort_list, page, done);
    }

    /// Read the given cohorts into `page`
    pub fn read_with_cohorts<F>(&self, cohorts: &[Cohort], page: &Arc<PropertyPage>, done: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.reads_started.store(true, Ordering::Release);
        page.setup_cohorts(cohorts);

        if !self.enabled() || cohorts.is_empty() {
            debug!(url = page.url(), "property cache read aborted");
            page.abort();
            done(false);
            return;
        }

        let weak = Arc::downgrade(page);
        let store_done: StoreDone = Box::new(move |success| {
            if let Some(page) = weak.upgrade() {
                page.call_done(success);
            }
            done(success);
        });

        let callback = self.shared.store.get(
            page.url(),
            page.options_signature(),
            &page.store_key_suffix(),
            cohorts,
            page,
            store_done,
        );
        if let Some(callback) = callback {
            page.set_store_callback(callback);
        }
    }

    /// Read all cohorts and wait for completion
    pub async fn read_async(&self, page: &Arc<PropertyPage>) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.read(page, move |success| {
            let _ = tx.send(success);
        });
        rx.await.unwrap_or(false)
    }

    /// Whether `value` changes rarely enough to act on
    pub fn is_stable(&self, value: &PropertyValue) -> bool {
        value.is_stable(self.mutations_per_1000_writes_threshold)
    }

    /// Whether `value` was written more than `ttl_ms` ago
    pub fn is_expired(&self, value: &PropertyValue, ttl_ms: i64) -> bool {
        debug_assert!(value.has_value());
        self.shared.timer.now_ms() > value.write_timestamp_ms() + ttl_ms
    }

    pub fn set_mutations_per_1000_writes_threshold(&mut self, threshold: u32) {
        self.mutations_per_1000_writes_threshold = threshold;
    }

    pub fn mutations_per_1000_writes_threshold(&self) -> u32 {
        self.mutations_per_1000_writes_threshold
    }

    /// Disabled caches complete reads immediately and drop writes
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Release);
    }

    pub fn enabled(&self) -> bool {
        self.shared.enabled()
    }

    pub fn property_store(&self) -> &Arc<dyn PropertyStore> {
        &self.shared.store
    }

    pub fn timer(&self) -> &Arc<dyn Timer> {
        &self.shared.timer
    }

    pub(crate) fn shared(&self) -> Arc<CacheShared> {
        Arc::clone(&self.shared)
    }
}

// =============================================================================
// Tests
// =============================================================================
