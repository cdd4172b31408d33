//! Two-Level Property Store
//!
//! Reads try a fast primary store first. Cohorts the primary misses are
//! looked up in the secondary store, and any found there are written back
//! to the primary. Writes go to both.
//!
//! A fast-finish while the primary is outstanding is forwarded to the
//! primary; the read then completes with the primary's partial result and
//! the secondary is never consulted. A fast-finish while the secondary is
//! outstanding is forwarded to the secondary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::cohort::Cohort;
use super::page::PropertyPage;
use super::store::{PropertyStore, PropertyStoreGetCallback, StoreDone};
use super::value::PropertyCacheValues;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupLevel {
    Primary,
    Secondary,
    Done,
}

struct TwoLevelState {
    level: LookupLevel,
    fast_finish_called: bool,
    delete_when_done: bool,
    primary_success: bool,
    done: Option<StoreDone>,
    secondary_cohorts: Vec<Cohort>,
    primary_handle: Option<Arc<dyn PropertyStoreGetCallback>>,
    secondary_handle: Option<Arc<dyn PropertyStoreGetCallback>>,
}

/// Tracks one read across both stores
struct TwoLevelGetCallback {
    url: String,
    options_signature: String,
    cache_key_suffix: String,
    cohorts: Vec<Cohort>,
    page: Weak<PropertyPage>,
    primary: Arc<dyn PropertyStore>,
    secondary: Arc<dyn PropertyStore>,
    state: Mutex<TwoLevelState>,
}

impl TwoLevelGetCallback {
    /// Keep the primary's handle while its lookup is outstanding
    fn attach_primary(&self, handle: Option<Arc<dyn PropertyStoreGetCallback>>) {
        let Some(handle) = handle else {
            return;
        };
        let (release, fast_finish) = {
            let mut state = self.state.lock();
            if state.level == LookupLevel::Primary {
                state.primary_handle = Some(Arc::clone(&handle));
                (false, state.fast_finish_called)
            } else {
                (true, false)
            }
        };
        if fast_finish {
            handle.fast_finish_lookup();
        }
        if release {
            handle.delete_when_done();
        }
    }

    fn primary_lookup_done(self: &Arc<Self>, success: bool) {
        let page = self.page.upgrade();
        let (finished, primary_handle) = {
            let mut state = self.state.lock();
            state.primary_success = success;
            let misses: Vec<Cohort> = match page.as_ref() {
                Some(page) => self
                    .cohorts
                    .iter()
                    .filter(|cohort| !page.is_cohort_present(cohort))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };

            let finished = if state.fast_finish_called || misses.is_empty() {
                state.level = LookupLevel::Done;
                state.done.take()
            } else {
                state.level = LookupLevel::Secondary;
                state.secondary_cohorts = misses;
                None
            };
            (finished, state.primary_handle.take())
        };

        if let Some(handle) = primary_handle {
            handle.delete_when_done();
        }
        if let Some(done) = finished {
            trace!(url = %self.url, success, "two-level lookup satisfied by primary");
            done(success);
            return;
        }
        if let Some(page) = page {
            self.issue_secondary_get(&page);
        }
    }

    fn issue_secondary_get(self: &Arc<Self>, page: &Arc<PropertyPage>) {
        let cohorts = self.state.lock().secondary_cohorts.clone();
        debug!(url = %self.url, misses = cohorts.len(), "two-level lookup consulting secondary");

        let this = Arc::clone(self);
        let handle = self.secondary.get(
            &self.url,
            &self.options_signature,
            &self.cache_key_suffix,
            &cohorts,
            page,
            Box::new(move |success| this.secondary_lookup_done(success)),
        );
        let Some(handle) = handle else {
            return;
        };

        let (release, fast_finish) = {
            let mut state = self.state.lock();
            if state.level == LookupLevel::Secondary {
                state.secondary_handle = Some(Arc::clone(&handle));
                (false, state.fast_finish_called)
            } else {
                (true, false)
            }
        };
        if fast_finish {
            handle.fast_finish_lookup();
        }
        if release {
            handle.delete_when_done();
        }
    }

    fn secondary_lookup_done(&self, success: bool) {
        let (done, success, cohorts, handle) = {
            let mut state = self.state.lock();
            state.level = LookupLevel::Done;
            (
                state.done.take(),
                success || state.primary_success,
                state.secondary_cohorts.clone(),
                state.secondary_handle.take(),
            )
        };

        if success {
            if let Some(page) = self.page.upgrade() {
                for cohort in &cohorts {
                    if let Some(values) = page.encode_property_cache_values(cohort) {
                        debug!(url = %self.url, cohort = %cohort, "promoting cohort to primary store");
                        self.primary.put(
                            &self.url,
                            &self.options_signature,
                            &self.cache_key_suffix,
                            cohort,
                            &values,
                            None,
                        );
                    }
                }
            }
        }

        if let Some(done) = done {
            done(success);
        }
        if let Some(handle) = handle {
            handle.delete_when_done();
        }
    }
}

impl PropertyStoreGetCallback for TwoLevelGetCallback {
    fn fast_finish_lookup(&self) {
        let handle = {
            let mut state = self.state.lock();
            state.fast_finish_called = true;
            match state.level {
                LookupLevel::Primary => state.primary_handle.clone(),
                LookupLevel::Secondary => state.secondary_handle.clone(),
                LookupLevel::Done => None,
            }
        };
        if let Some(handle) = handle {
            handle.fast_finish_lookup();
        }
    }

    fn delete_when_done(&self) {
        let mut state = self.state.lock();
        assert!(!state.delete_when_done, "delete_when_done called twice for {}", self.url);
        state.delete_when_done = true;
    }
}

/// Property store layering a fast primary over an authoritative secondary
pub struct TwoLevelPropertyStore {
    primary: Arc<dyn PropertyStore>,
    secondary: Arc<dyn PropertyStore>,
    enable_get_cancellation: AtomicBool,
}

impl TwoLevelPropertyStore {
    /// Combine two stores; enables get cancellation on both
    pub fn new(primary: Arc<dyn PropertyStore>, secondary: Arc<dyn PropertyStore>) -> Self {
        primary.set_enable_get_cancellation(true);
        secondary.set_enable_get_cancellation(true);
        Self {
            primary,
            secondary,
            enable_get_cancellation: AtomicBool::new(true),
        }
    }

    pub fn primary(&self) -> &Arc<dyn PropertyStore> {
        &self.primary
    }

    pub fn secondary(&self) -> &Arc<dyn PropertyStore> {
        &self.secondary
    }
}

impl PropertyStore for TwoLevelPropertyStore {
    fn get(
        &self,
        url: &str,
        options_signature: &str,
        cache_key_suffix: &str,
        cohorts: &[Cohort],
        page: &Arc<PropertyPage>,
        done: StoreDone,
    ) -> Option<Arc<dyn PropertyStoreGetCallback>> {
        let callback = Arc::new(TwoLevelGetCallback {
            url: url.to_string(),
            options_signature: options_signature.to_string(),
            cache_key_suffix: cache_key_suffix.to_string(),
            cohorts: cohorts.to_vec(),
            page: Arc::downgrade(page),
            primary: Arc::clone(&self.primary),
            secondary: Arc::clone(&self.secondary),
            state: Mutex::new(TwoLevelState {
                level: LookupLevel::Primary,
                fast_finish_called: false,
                delete_when_done: false,
                primary_success: false,
                done: Some(done),
                secondary_cohorts: Vec::new(),
                primary_handle: None,
                secondary_handle: None,
            }),
        });

        let this = Arc::clone(&callback);
        let primary_handle = self.primary.get(
            url,
            options_signature,
            cache_key_suffix,
            cohorts,
            page,
            Box::new(move |success| this.primary_lookup_done(success)),
        );
        callback.attach_primary(primary_handle);
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
        self.primary
            .put(url, options_signature, cache_key_suffix, cohort, values, None);
        self.secondary
            .put(url, options_signature, cache_key_suffix, cohort, values, None);
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
        format!("TwoLevel({}, {})", self.primary.name(), self.secondary.name())
    }
}

// =============================================================================
// Tests
// =============================================================================
