//! Property Cache
//!
//! Long-lived, slowly changing facts about pages, grouped into cohorts and
//! persisted through a [`PropertyStore`].
//!
//! # Usage
//!
//! ```text
//! cache.add_cohort(..)        once, at startup
//! page = PropertyPage::new(&cache, url)
//! cache.read(&page, done)     exactly once per page
//! page.get_property / update_value / delete_property
//! page.write_cohort(..)       per dirtied cohort
//! ```

pub mod cache;
pub mod cohort;
pub mod page;
pub mod store;
pub mod two_level;
pub mod value;

pub use cache::PropertyCache;
pub use cohort::{Cohort, CohortList};
pub use page::{PageType, PropertyHandle, PropertyPage, PropertyPageBuilder};
pub use store::{CachePropertyStore, PropertyStore, PropertyStoreGetCallback, StoreDone};
pub use two_level::TwoLevelPropertyStore;
pub use value::{PropertyCacheValues, PropertyValue, PropertyValueProto};
