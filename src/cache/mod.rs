//! Composable Key/Value Cache Layer
//!
//! Every layer implements [`Cache`], so backends and wrappers stack freely.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  CachePropertyStore                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CacheStats (per cohort counters)                            │
//! │         │                                                    │
//! │  WriteThroughCache ─────────────┐                            │
//! │    cache1: LruCache             │ cache2:                    │
//! │                                 ▼                            │
//! │                     CacheBatcher (queue + multi-get)         │
//! │                                 │                            │
//! │                     AsyncCache (tokio blocking pool)         │
//! │                                 │                            │
//! │                     FallbackCache (small 'S' / large 'L')    │
//! │                        │                  │                  │
//! │                   small backend     large backend            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Callbacks may fire on the calling thread or a worker thread
//! - No layer holds a lock while invoking a callback
//! - Saturation and shutdown surface as not-found, never as errors

pub mod async_cache;
pub mod batcher;
pub mod codec;
pub mod delay;
pub mod fallback;
pub mod interface;
pub mod lru;
pub mod stats;
pub mod topology;
pub mod write_through;

pub use async_cache::AsyncCache;
pub use batcher::{BatcherConfig, CacheBatcher};
pub use delay::DelayCache;
pub use fallback::FallbackCache;
pub use interface::{blocking_get, callback_fn, Cache, CacheCallback, KeyCallback, KeyState};
pub use lru::{LruCache, LruStats};
pub use stats::CacheStats;
pub use topology::CacheTopology;
pub use write_through::{WriteThroughCache, WriteThroughConfig};
