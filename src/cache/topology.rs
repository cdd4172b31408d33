//! Cache Topology - Builds the cache stack and property cache from config
//!
//! The in-process LRU is always present. A caller-supplied secondary backend
//! is wrapped, innermost first, in:
//!
//! ```text
//! FallbackCache   when `fallback` is configured (needs a large backend)
//! AsyncCache      when the backend blocks (needs a tokio runtime)
//! CacheBatcher
//! ```
//!
//! Cohorts bind to a backend by tier:
//!
//! | tier        | backend                                               |
//! |-------------|-------------------------------------------------------|
//! | `primary`   | LRU                                                   |
//! | `secondary` | secondary stack                                       |
//! | `default`   | write-through(LRU, secondary) if configured, else the |
//! |             | secondary stack, else the LRU                         |
//!
//! With secondary cohorts the store is a [`TwoLevelPropertyStore`] whose
//! primary is an LRU-only store, so secondary hits are promoted into memory.
//! The resulting topology is immutable; callers share it by reference.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use super::async_cache::AsyncCache;
use super::batcher::CacheBatcher;
use super::fallback::FallbackCache;
use super::interface::Cache;
use super::lru::LruCache;
use super::write_through::WriteThroughCache;
use crate::config::{CohortTier, PropertyCacheConfig};
use crate::error::{Error, Result};
use crate::property::{CachePropertyStore, PropertyCache, PropertyStore, TwoLevelPropertyStore};
use crate::stats::{SimpleStats, Statistics};
use crate::timer::{SystemTimer, Timer};

/// Assembled cache stack plus the property cache over it
pub struct CacheTopology {
    lru: Arc<LruCache>,
    secondary: Option<Arc<dyn Cache>>,
    default_cache: Arc<dyn Cache>,
    property_cache: PropertyCache,
    stats: Arc<dyn Statistics>,
}

/// Collects the backends and services a topology is built from
pub struct CacheTopologyBuilder {
    config: PropertyCacheConfig,
    secondary_backend: Option<Arc<dyn Cache>>,
    large_backend: Option<Arc<dyn Cache>>,
    timer: Option<Arc<dyn Timer>>,
    stats: Option<Arc<dyn Statistics>>,
    runtime: Option<Handle>,
}

impl CacheTopologyBuilder {
    /// Slow, shared backend behind the LRU
    pub fn secondary_backend(mut self, cache: Arc<dyn Cache>) -> Self {
        self.secondary_backend = Some(cache);
        self
    }

    /// Large-value backend used by the fallback layer
    pub fn large_backend(mut self, cache: Arc<dyn Cache>) -> Self {
        self.large_backend = Some(cache);
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn stats(mut self, stats: Arc<dyn Statistics>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Runtime whose blocking pool serves a blocking secondary backend.
    /// Defaults to the runtime `build` is called from.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<CacheTopology> {
        let config = self.config;
        config.validate()?;
        let timer = self
            .timer
            .unwrap_or_else(|| Arc::new(SystemTimer::new()) as Arc<dyn Timer>);
        let stats = self
            .stats
            .unwrap_or_else(|| Arc::new(SimpleStats::new()) as Arc<dyn Statistics>);

        let lru = Arc::new(LruCache::new(config.lru.max_bytes));
        let lru_cache: Arc<dyn Cache> = lru.clone();

        let secondary = match self.secondary_backend {
            Some(backend) => {
                let mut cache = backend;
                if let Some(fallback) = &config.fallback {
                    let large = self.large_backend.ok_or_else(|| {
                        Error::Config("fallback is configured but no large backend was supplied".into())
                    })?;
                    cache = Arc::new(FallbackCache::new(cache, large, fallback.threshold_bytes));
                }
                if cache.is_blocking() {
                    let runtime = match self.runtime {
                        Some(handle) => handle,
                        None => Handle::try_current().map_err(|_| {
                            Error::Config("a blocking secondary backend needs a tokio runtime".into())
                        })?,
                    };
                    cache = Arc::new(AsyncCache::new(
                        cache,
                        runtime,
                        config.async_cache.max_parallel,
                        stats.as_ref(),
                    ));
                }
                let batched: Arc<dyn Cache> =
                    Arc::new(CacheBatcher::with_config(cache, stats.as_ref(), config.batcher.clone()));
                Some(batched)
            }
            None if config.fallback.is_some() => {
                return Err(Error::Config("fallback needs a secondary backend".into()));
            }
            None => None,
        };

        if secondary.is_none() && config.has_secondary_cohorts() {
            return Err(Error::Config("secondary cohorts need a secondary backend".into()));
        }

        let default_cache: Arc<dyn Cache> = match (&secondary, &config.write_through) {
            (Some(secondary), Some(write_through)) => Arc::new(WriteThroughCache::with_config(
                lru_cache.clone(),
                secondary.clone(),
                write_through.clone(),
            )),
            (Some(secondary), None) => secondary.clone(),
            (None, _) => lru_cache.clone(),
        };

        let mut routed = CachePropertyStore::new(config.key_prefix.clone(), default_cache.clone(), stats.clone());
        for cohort in &config.cohorts {
            match (cohort.tier, &secondary) {
                (CohortTier::Primary, _) => routed.add_cohort_with_cache(&cohort.name, lru_cache.clone()),
                (CohortTier::Secondary, Some(secondary)) => {
                    routed.add_cohort_with_cache(&cohort.name, secondary.clone())
                }
                _ => routed.add_cohort(&cohort.name),
            }
        }

        let store: Arc<dyn PropertyStore> = if config.has_secondary_cohorts() {
            let mut memory = CachePropertyStore::new(config.key_prefix.clone(), lru_cache.clone(), stats.clone());
            for cohort in &config.cohorts {
                memory.add_cohort(&cohort.name);
            }
            Arc::new(TwoLevelPropertyStore::new(Arc::new(memory), Arc::new(routed)))
        } else {
            Arc::new(routed)
        };

        let mut property_cache = PropertyCache::new(store, timer, stats.clone());
        for cohort in &config.cohorts {
            property_cache.add_cohort(&cohort.name);
        }
        property_cache.set_mutations_per_1000_writes_threshold(config.mutations_per_1000_writes_threshold);
        property_cache.set_enabled(config.enabled);

        info!(
            store = %property_cache.property_store().name(),
            cohorts = config.cohorts.len(),
            "property cache topology built"
        );

        Ok(CacheTopology {
            lru,
            secondary,
            default_cache,
            property_cache,
            stats,
        })
    }
}

impl CacheTopology {
    pub fn builder(config: PropertyCacheConfig) -> CacheTopologyBuilder {
        CacheTopologyBuilder {
            config,
            secondary_backend: None,
            large_backend: None,
            timer: None,
            stats: None,
            runtime: None,
        }
    }

    /// Topology with only the in-process LRU
    pub fn in_memory(config: PropertyCacheConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn property_cache(&self) -> &PropertyCache {
        &self.property_cache
    }

    pub fn lru(&self) -> &Arc<LruCache> {
        &self.lru
    }

    /// Fully wrapped secondary stack, if a backend was supplied
    pub fn secondary(&self) -> Option<&Arc<dyn Cache>> {
        self.secondary.as_ref()
    }

    /// Backend used by `default`-tier cohorts
    pub fn default_cache(&self) -> &Arc<dyn Cache> {
        &self.default_cache
    }

    pub fn stats(&self) -> &Arc<dyn Statistics> {
        &self.stats
    }

    /// Stop every layer; outstanding gets finish as not-found
    pub fn shut_down(&self) {
        self.property_cache.set_enabled(false);
        if let Some(secondary) = &self.secondary {
            secondary.shut_down();
        }
        self.lru.shut_down();
    }
}

// =============================================================================
// Tests
// =============================================================================
