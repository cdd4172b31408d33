//! pcache - Multi-tier Property Cache
//!
//! Records long-lived, slowly changing facts about pages ("properties") so
//! that a rewriting pipeline can consult them on later requests. Properties
//! are grouped into cohorts; each cohort of each page is persisted as one
//! entry in a stack of composable key/value caches.
//!
//! # Architecture
//!
//! ```text
//! PropertyCache ─► PropertyStore (CachePropertyStore | TwoLevelPropertyStore)
//!                        │
//!                        ▼
//!          Cache stack (LRU, write-through, batcher, async, fallback)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Callback-based key/value cache interface and layers
//! - [`property`] - Property values, pages, cohorts and stores
//! - [`config`] - YAML topology configuration
//! - [`error`] - Error types
//! - [`logging`] - Subscriber installation
//! - [`stats`] - Named counters with Prometheus export
//! - [`timer`] - Wall-clock abstraction

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod property;
pub mod stats;
pub mod timer;

// Re-export commonly used types
pub use cache::{Cache, CacheCallback, CacheTopology, KeyState, LruCache};
pub use config::PropertyCacheConfig;
pub use error::{Error, Result};
pub use property::{
    Cohort, PageType, PropertyCache, PropertyHandle, PropertyPage, PropertyStore, PropertyValue,
};
pub use stats::{SimpleStats, Statistics};
pub use timer::{MockTimer, SystemTimer, Timer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
