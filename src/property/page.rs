//! Property Page - In-memory working set for one key
//!
//! A page is read once from the property store, then mutated and written
//! back one cohort at a time. All page state sits behind a single mutex;
//! individual property values have their own lock so that handles returned
//! by [`PropertyPage::get_property`] stay valid for the page's lifetime.
//!
//! Reading a property, or writing a cohort, before the read has completed
//! is a programming error and panics.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, trace};

use super::cache::{CacheShared, PropertyCache};
use super::cohort::Cohort;
use super::store::PropertyStoreGetCallback;
use super::value::{PropertyCacheValues, PropertyValue, PropertyValueProto};
use crate::cache::KeyState;

/// Suffix of the page-wide fallback namespace
pub const FALLBACK_SUFFIX: &str = "@fallback";
/// Suffix of the base-path fallback namespace
pub const BASE_PATH_FALLBACK_SUFFIX: &str = "#fallback";
/// Suffix of the per-origin namespace
pub const PER_ORIGIN_SUFFIX: &str = "#per_origin";

/// Which key namespace a page lives in.
///
/// The suffixes are reserved: a caller's own cache key suffix must not end
/// with any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PageType {
    /// The page itself
    #[default]
    Page,
    /// Page-wide key consulted when the exact page is not yet cached
    Fallback,
    /// Key shared by pages under the same base path
    BasePathFallback,
    /// Properties shared by every page of an origin
    PerOrigin,
}

impl PageType {
    /// Suffix appended to the cache key suffix for this page type
    pub fn suffix(self) -> &'static str {
        match self {
            PageType::Page => "",
            PageType::Fallback => FALLBACK_SUFFIX,
            PageType::BasePathFallback => BASE_PATH_FALLBACK_SUFFIX,
            PageType::PerOrigin => PER_ORIGIN_SUFFIX,
        }
    }
}

/// Shared handle to a property held by a page.
///
/// Clones refer to the same value; the handle stays valid after the page
/// is dropped.
#[derive(Clone, Default)]
pub struct PropertyHandle(Arc<RwLock<PropertyValue>>);

impl PropertyHandle {
    fn from_value(value: PropertyValue) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    /// Borrow the value
    pub fn read(&self) -> RwLockReadGuard<'_, PropertyValue> {
        self.0.read()
    }

    /// Copy of the current body
    pub fn value(&self) -> Bytes {
        self.0.read().value().clone()
    }

    pub fn has_value(&self) -> bool {
        self.0.read().has_value()
    }

    /// Record a write; see [`PropertyValue::set_value`]
    pub fn set_value(&self, body: impl Into<Bytes>, now_ms: i64) {
        self.0.write().set_value(body, now_ms);
    }

    /// Whether both handles refer to the same property
    pub fn same_as(&self, other: &PropertyHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn replace(&self, value: PropertyValue) {
        *self.0.write() = value;
    }
}

impl fmt::Debug for PropertyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PropertyHandle").field(&*self.0.read()).finish()
    }
}

struct CohortData {
    properties: BTreeMap<String, PropertyHandle>,
    cache_state: KeyState,
    has_value: bool,
    has_deleted_property: bool,
}

impl Default for CohortData {
    fn default() -> Self {
        Self {
            properties: BTreeMap::new(),
            cache_state: KeyState::NotFound,
            has_value: false,
            has_deleted_property: false,
        }
    }
}

#[derive(Default)]
struct PageState {
    cohorts: HashMap<Cohort, CohortData>,
    read_issued: bool,
    was_read: bool,
    read_success: bool,
}

type Validator = Box<dyn Fn(i64) -> bool + Send + Sync>;

/// Properties for a single key, grouped by cohort
pub struct PropertyPage {
    page_type: PageType,
    url: String,
    options_signature: String,
    cache_key_suffix: String,
    cache: Arc<CacheShared>,
    validator: Option<Validator>,
    state: Mutex<PageState>,
    store_callback: Mutex<Option<Arc<dyn PropertyStoreGetCallback>>>,
}

/// Builder for [`PropertyPage`]
pub struct PropertyPageBuilder {
    page_type: PageType,
    url: String,
    options_signature: String,
    cache_key_suffix: String,
    cache: Arc<CacheShared>,
    validator: Option<Validator>,
}

impl PropertyPageBuilder {
    pub fn page_type(mut self, page_type: PageType) -> Self {
        self.page_type = page_type;
        self
    }

    pub fn options_signature(mut self, signature: impl Into<String>) -> Self {
        self.options_signature = signature.into();
        self
    }

    pub fn cache_key_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.cache_key_suffix = suffix.into();
        self
    }

    /// Reject stored cohorts whose write timestamps fail `validator`
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(i64) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    pub fn build(self) -> Arc<PropertyPage> {
        Arc::new(PropertyPage {
            page_type: self.page_type,
            url: self.url,
            options_signature: self.options_signature,
            cache_key_suffix: self.cache_key_suffix,
            cache: self.cache,
            validator: self.validator,
            state: Mutex::new(PageState::default()),
            store_callback: Mutex::new(None),
        })
    }
}

impl PropertyPage {
    /// Start building a page for `url` bound to `cache`
    pub fn builder(cache: &PropertyCache, url: impl Into<String>) -> PropertyPageBuilder {
        PropertyPageBuilder {
            page_type: PageType::Page,
            url: url.into(),
            options_signature: String::new(),
            cache_key_suffix: String::new(),
            cache: cache.shared(),
            validator: None,
        }
    }

    /// Page for `url` with no signature or suffix
    pub fn new(cache: &PropertyCache, url: impl Into<String>) -> Arc<Self> {
        Self::builder(cache, url).build()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options_signature(&self) -> &str {
        &self.options_signature
    }

    pub fn cache_key_suffix(&self) -> &str {
        &self.cache_key_suffix
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    /// Suffix used for store keys: the caller's suffix plus the page type's
    pub fn store_key_suffix(&self) -> String {
        format!("{}{}", self.cache_key_suffix, self.page_type.suffix())
    }

    /// Whether the read cycle has completed, successfully or not
    pub fn was_read(&self) -> bool {
        self.state.lock().was_read
    }

    /// Whether a stored cohort written at `write_timestamp_ms` may be used
    pub fn is_cache_valid(&self, write_timestamp_ms: i64) -> bool {
        self.validator
            .as_ref()
            .map_or(true, |validator| validator(write_timestamp_ms))
    }

    /// Handle to `name` in `cohort`, created empty if absent.
    ///
    /// # Panics
    ///
    /// If the page has not been read.
    pub fn get_property(&self, cohort: &Cohort, name: &str) -> PropertyHandle {
        let mut state = self.state.lock();
        assert!(
            state.was_read,
            "get_property({}, {}) on page {} before it was read",
            cohort, name, self.url
        );
        let was_read = state.was_read;
        state
            .cohorts
            .entry(cohort.clone())
            .or_default()
            .properties
            .entry(name.to_string())
            .or_insert_with(|| {
                let mut value = PropertyValue::new();
                value.set_was_read(was_read);
                PropertyHandle::from_value(value)
            })
            .clone()
    }

    /// Set `name` in `cohort` to `body` at the cache's current time.
    ///
    /// Ignored if the stored value is newer than now, which happens when the
    /// clock steps backwards.
    pub fn update_value(&self, cohort: &Cohort, name: &str, body: impl Into<Bytes>) {
        let property = self.get_property(cohort, name);
        let now_ms = self.cache.timer.now_ms();
        let mut value = property.0.write();
        if value.write_timestamp_ms() <= now_ms {
            value.set_value(body, now_ms);
        } else {
            debug!(
                url = %self.url,
                cohort = %cohort,
                property = name,
                "ignoring write older than stored value"
            );
        }
    }

    /// Drop `name` from `cohort`; persisted by the next `write_cohort`
    pub fn delete_property(&self, cohort: &Cohort, name: &str) {
        let mut state = self.state.lock();
        assert!(state.was_read, "delete_property on page {} before it was read", self.url);
        if let Some(data) = state.cohorts.get_mut(cohort) {
            if data.properties.remove(name).is_some() {
                data.has_deleted_property = true;
            }
        }
    }

    /// Persist every live property of `cohort`.
    ///
    /// Writes nothing when the cohort has no values and nothing was deleted.
    /// When properties were deleted and none remain, the stored cohort is
    /// removed.
    ///
    /// # Panics
    ///
    /// If the page has not been read.
    pub fn write_cohort(&self, cohort: &Cohort) {
        {
            let state = self.state.lock();
            assert!(state.was_read, "write_cohort({}) on page {} before it was read", cohort, self.url);
        }
        if !self.cache.enabled() {
            return;
        }

        let values = self.encode_property_cache_values(cohort);
        let deleted = self.has_deleted_property(cohort);
        if values.is_none() && !deleted {
            trace!(url = %self.url, cohort = %cohort, "nothing to write");
            return;
        }

        {
            let state = self.state.lock();
            if let Some(data) = state.cohorts.get(cohort) {
                for handle in data.properties.values() {
                    handle.0.write().clear_changed();
                }
            }
        }

        let values = values.unwrap_or_default();
        self.cache.store.put(
            &self.url,
            &self.options_signature,
            &self.store_key_suffix(),
            cohort,
            &values,
            None,
        );
    }

    /// Backend state seen for `cohort` on the last read
    pub fn get_cache_state(&self, cohort: &Cohort) -> KeyState {
        let state = self.state.lock();
        assert!(state.was_read, "get_cache_state on page {} before it was read", self.url);
        state
            .cohorts
            .get(cohort)
            .map_or(KeyState::NotFound, |data| data.cache_state)
    }

    pub fn set_cache_state(&self, cohort: &Cohort, cache_state: KeyState) {
        self.state
            .lock()
            .cohorts
            .entry(cohort.clone())
            .or_default()
            .cache_state = cache_state;
    }

    /// Whether the read populated any value for `cohort`
    pub fn is_cohort_present(&self, cohort: &Cohort) -> bool {
        self.state
            .lock()
            .cohorts
            .get(cohort)
            .map_or(false, |data| data.has_value)
    }

    /// Persisted form of every valid property in `cohort`, or `None` if
    /// there are none
    pub fn encode_property_cache_values(&self, cohort: &Cohort) -> Option<PropertyCacheValues> {
        let state = self.state.lock();
        let data = state.cohorts.get(cohort)?;
        let value: Vec<PropertyValueProto> = data
            .properties
            .iter()
            .filter_map(|(name, handle)| {
                let value = handle.read();
                value.has_value().then(|| value.to_proto(name))
            })
            .collect();
        (!value.is_empty()).then_some(PropertyCacheValues { value })
    }

    /// Install a value read from a store into `cohort`
    pub fn add_value_from_protobuf(&self, cohort: &Cohort, proto: &PropertyValueProto) {
        let mut state = self.state.lock();
        let data = state.cohorts.entry(cohort.clone()).or_default();
        data.has_value = true;
        let value = PropertyValue::from_proto(proto);
        match data.properties.get(&proto.name) {
            Some(handle) => handle.replace(value),
            None => {
                data.properties
                    .insert(proto.name.clone(), PropertyHandle::from_value(value));
            }
        }
    }

    /// Ask the outstanding store lookup to finish with what it has
    pub fn fast_finish_lookup(&self) {
        let callback = self.store_callback.lock().clone();
        if let Some(callback) = callback {
            callback.fast_finish_lookup();
        }
    }

    /// Complete the read as a failure without consulting the store
    pub fn abort(&self) {
        self.call_done(false);
    }

    fn has_deleted_property(&self, cohort: &Cohort) -> bool {
        self.state
            .lock()
            .cohorts
            .get(cohort)
            .map_or(false, |data| data.has_deleted_property)
    }

    pub(crate) fn setup_cohorts(&self, cohorts: &[Cohort]) {
        let mut state = self.state.lock();
        assert!(!state.read_issued, "page {} read more than once", self.url);
        state.read_issued = true;
        for cohort in cohorts {
            state.cohorts.entry(cohort.clone()).or_default();
        }
    }

    pub(crate) fn set_store_callback(&self, callback: Arc<dyn PropertyStoreGetCallback>) {
        let mut slot = self.store_callback.lock();
        assert!(slot.is_none(), "page {} already has a store lookup", self.url);
        *slot = Some(callback);
    }

    /// Whether the completed read found any cohort. False before completion
    /// and after [`abort`](Self::abort).
    pub fn read_succeeded(&self) -> bool {
        self.state.lock().read_success
    }

    pub(crate) fn call_done(&self, success: bool) {
        {
            let mut state = self.state.lock();
            state.was_read = true;
            state.read_success = success;
        }
        trace!(url = %self.url, success, "property page read complete");
    }
}

impl Drop for PropertyPage {
    fn drop(&mut self) {
        if let Some(callback) = self.store_callback.get_mut().take() {
            callback.delete_when_done();
        }
    }
}

impl fmt::Debug for PropertyPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyPage")
            .field("url", &self.url)
            .field("page_type", &self.page_type)
            .field("was_read", &self.was_read())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::testing::{lru_property_cache, Fixture};
    use crate::timer::MockTimer;

    fn read_page(f: &Fixture, url: &str) -> Arc<PropertyPage> {
        let page = PropertyPage::new(&f.cache, url);
        f.cache.read(&page, |_| {});
        page
    }

    #[test]
    #[should_panic(expected = "before it was read")]
    fn test_get_property_before_read_panics() {
        let f = lru_property_cache();
        let page = PropertyPage::new(&f.cache, "u");
        page.get_property(&f.dom, "p");
    }

    #[test]
    #[should_panic(expected = "before it was read")]
    fn test_write_cohort_before_read_panics() {
        let f = lru_property_cache();
        let page = PropertyPage::new(&f.cache, "u");
        page.write_cohort(&f.dom);
    }

    #[test]
    fn test_get_property_is_stable() {
        let f = lru_property_cache();
        let page = read_page(&f, "u");
        let a = page.get_property(&f.dom, "p");
        let b = page.get_property(&f.dom, "p");
        assert!(a.same_as(&b));
        assert!(!a.has_value());
        assert!(a.read().was_read());

        page.update_value(&f.dom, "p", "v");
        assert_eq!(a.value().as_ref(), b"v");
    }

    #[test]
    fn test_update_ignores_backwards_clock() {
        let f = lru_property_cache();
        let page = read_page(&f, "u");
        page.update_value(&f.dom, "p", "new");
        f.timer.advance_ms(-1000);
        page.update_value(&f.dom, "p", "stale");

        let property = page.get_property(&f.dom, "p");
        assert_eq!(property.value().as_ref(), b"new");
        assert_eq!(property.read().num_writes(), 1);
        assert_eq!(property.read().write_timestamp_ms(), MockTimer::APR_5_2010_MS);
    }

    #[test]
    fn test_encode_skips_unset_properties() {
        let f = lru_property_cache();
        let page = read_page(&f, "u");
        assert!(page.encode_property_cache_values(&f.dom).is_none());

        page.get_property(&f.dom, "untouched");
        assert!(page.encode_property_cache_values(&f.dom).is_none());

        page.update_value(&f.dom, "set", "v");
        let values = page.encode_property_cache_values(&f.dom).unwrap();
        assert_eq!(values.value.len(), 1);
        assert_eq!(values.value[0].name, "set");
    }

    #[test]
    fn test_write_clears_changed() {
        let f = lru_property_cache();
        let page = read_page(&f, "u");
        page.update_value(&f.dom, "p", "v");
        let property = page.get_property(&f.dom, "p");
        assert!(property.read().changed());
        page.write_cohort(&f.dom);
        assert!(!property.read().changed());
    }

    #[test]
    fn test_delete_property_removes_stored_cohort() {
        let f = lru_property_cache();
        let page = read_page(&f, "u");
        page.update_value(&f.dom, "p", "v");
        page.write_cohort(&f.dom);
        assert_eq!(f.lru.num_elements(), 1);

        let page = read_page(&f, "u");
        assert!(page.is_cohort_present(&f.dom));
        page.delete_property(&f.dom, "p");
        page.write_cohort(&f.dom);
        assert_eq!(f.lru.num_elements(), 0);
    }

    #[test]
    fn test_cache_state_defaults_to_not_found() {
        let f = lru_property_cache();
        let page = read_page(&f, "u");
        assert_eq!(page.get_cache_state(&f.dom), KeyState::NotFound);
        page.set_cache_state(&f.dom, KeyState::Available);
        assert_eq!(page.get_cache_state(&f.dom), KeyState::Available);
    }

    #[test]
    fn test_add_value_updates_existing_handle() {
        let f = lru_property_cache();
        let page = read_page(&f, "u");
        let handle = page.get_property(&f.dom, "p");
        page.add_value_from_protobuf(
            &f.dom,
            &PropertyValueProto {
                name: "p".into(),
                body: Bytes::from_static(b"stored"),
                write_timestamp_ms: 7,
                update_mask: 1,
                num_writes: 1,
            },
        );
        assert_eq!(handle.value().as_ref(), b"stored");
        assert!(page.is_cohort_present(&f.dom));
    }

    #[test]
    fn test_page_type_suffix() {
        assert_eq!(PageType::Page.suffix(), "");
        assert_eq!(PageType::Fallback.suffix(), "@fallback");

        let f = lru_property_cache();
        let page = PropertyPage::builder(&f.cache, "u")
            .cache_key_suffix("mobile")
            .page_type(PageType::Fallback)
            .build();
        assert_eq!(page.store_key_suffix(), "mobile@fallback");
    }

    #[test]
    fn test_page_type_keys_keep_two_separators() {
        assert_eq!(PageType::BasePathFallback.suffix(), "#fallback");
        assert_eq!(PageType::PerOrigin.suffix(), "#per_origin");

        let f = lru_property_cache();
        for page_type in [PageType::BasePathFallback, PageType::PerOrigin] {
            let page = PropertyPage::builder(&f.cache, "http://a.com/x")
                .page_type(page_type)
                .build();
            f.cache.read(&page, |_| {});
            page.update_value(&f.dom, "p", "v");
            page.write_cohort(&f.dom);
            let key = format!("prop_page/http://a.com/x@{}@dom", page_type.suffix());
            assert!(f.lru.contains(&key), "{}", key);
            assert_eq!(key.matches('@').count(), 2);
        }
        assert_eq!(f.lru.num_elements(), 2);
    }

    #[test]
    fn test_read_outcome_recorded() {
        let f = lru_property_cache();
        let page = read_page(&f, "u");
        assert!(!page.read_succeeded());
        page.update_value(&f.dom, "p", "v");
        page.write_cohort(&f.dom);

        let page = read_page(&f, "u");
        assert!(page.read_succeeded());

        let aborted = PropertyPage::new(&f.cache, "u");
        f.cache.set_enabled(false);
        f.cache.read(&aborted, |_| {});
        assert!(!aborted.read_succeeded());
    }

    #[test]
    fn test_validator() {
        let f = lru_property_cache();
        let page = PropertyPage::builder(&f.cache, "u")
            .validator(|ts| ts >= 100)
            .build();
        assert!(page.is_cache_valid(100));
        assert!(!page.is_cache_valid(99));
        assert!(PropertyPage::new(&f.cache, "u").is_cache_valid(0));
    }
}
