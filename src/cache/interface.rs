//! Cache Backend Interface
//!
//! Every backend and every composite layer implements [`Cache`]. Lookups are
//! callback based: an implementation may complete a lookup before `get`
//! returns or later on some other thread, and callers must not assume either.

use std::fmt;

use bytes::Bytes;
use crossbeam::channel::Receiver;

/// Outcome of a single-key lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    /// Value found and accepted
    Available,
    /// No value, or the value was rejected
    NotFound,
    /// The backend could not be reached
    NetworkError,
}

impl KeyState {
    /// Whether a value accompanies this state
    pub fn is_available(&self) -> bool {
        *self == KeyState::Available
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyState::Available => write!(f, "available"),
            KeyState::NotFound => write!(f, "not-found"),
            KeyState::NetworkError => write!(f, "network-error"),
        }
    }
}

/// Receives the result of a cache lookup
pub trait CacheCallback: Send {
    /// Inspect a candidate value before `done` is invoked.
    ///
    /// Returning `false` turns an [`KeyState::Available`] result into
    /// [`KeyState::NotFound`]. Composite caches call this on each candidate
    /// they find so that a rejected value from a fast tier can be retried
    /// against a slower one.
    fn validate_candidate(&mut self, _key: &str, _state: KeyState, _value: Option<&Bytes>) -> bool {
        true
    }

    /// Deliver the final result. `value` is `Some` iff `state` is available.
    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>);
}

/// A key paired with the callback that receives its result
pub struct KeyCallback {
    pub key: String,
    pub callback: Box<dyn CacheCallback>,
}

impl KeyCallback {
    pub fn new(key: impl Into<String>, callback: Box<dyn CacheCallback>) -> Self {
        Self {
            key: key.into(),
            callback,
        }
    }
}

impl fmt::Debug for KeyCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCallback").field("key", &self.key).finish()
    }
}

/// Validate `value` against `callback` and deliver the result.
///
/// This is the one place where a found value is downgraded to not-found when
/// the consumer rejects it.
pub fn report(mut callback: Box<dyn CacheCallback>, key: &str, state: KeyState, value: Option<Bytes>) {
    match (state, value) {
        (KeyState::Available, Some(value)) => {
            if callback.validate_candidate(key, state, Some(&value)) {
                callback.done(KeyState::Available, Some(value));
            } else {
                callback.done(KeyState::NotFound, None);
            }
        }
        (KeyState::Available, None) => callback.done(KeyState::NotFound, None),
        (state, _) => callback.done(state, None),
    }
}

/// Report not-found for a callback without consulting any backend
pub fn report_not_found(callback: Box<dyn CacheCallback>) {
    callback.done(KeyState::NotFound, None);
}

/// Abstract key/value store with asynchronous lookups
pub trait Cache: Send + Sync {
    /// Look up `key`, delivering the result to `callback` exactly once
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>);

    /// Look up several keys. The default issues one `get` per request.
    fn multi_get(&self, requests: Vec<KeyCallback>) {
        for request in requests {
            self.get(&request.key, request.callback);
        }
    }

    /// Store `value` under `key`. Fire and forget.
    fn put(&self, key: &str, value: Bytes);

    /// Remove `key`. Fire and forget.
    fn delete(&self, key: &str);

    /// Human-readable description of the cache stack
    fn name(&self) -> String;

    /// Whether `get` completes before returning
    fn is_blocking(&self) -> bool;

    /// Whether the cache still accepts work
    fn is_healthy(&self) -> bool;

    /// Stop accepting work; subsequent gets report not-found
    fn shut_down(&self);
}

/// Closure adapter for [`CacheCallback`]
pub struct FnCallback<F>
where
    F: FnOnce(KeyState, Option<Bytes>) + Send,
{
    f: F,
}

impl<F> CacheCallback for FnCallback<F>
where
    F: FnOnce(KeyState, Option<Bytes>) + Send,
{
    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        (self.f)(state, value)
    }
}

/// Box a closure as a cache callback
pub fn callback_fn<F>(f: F) -> Box<dyn CacheCallback>
where
    F: FnOnce(KeyState, Option<Bytes>) + Send + 'static,
{
    Box::new(FnCallback { f })
}

/// Issue a lookup whose result arrives on the returned channel
pub fn get_channel(cache: &dyn Cache, key: &str) -> Receiver<(KeyState, Option<Bytes>)> {
    let (tx, rx) = crossbeam::channel::bounded(1);
    cache.get(
        key,
        callback_fn(move |state, value| {
            let _ = tx.send((state, value));
        }),
    );
    rx
}

/// Look up `key` and wait for the result.
///
/// Blocks until the backend completes; do not call with a cache that may
/// hold the lookup indefinitely.
pub fn blocking_get(cache: &dyn Cache, key: &str) -> (KeyState, Option<Bytes>) {
    get_channel(cache, key)
        .recv()
        .unwrap_or((KeyState::NotFound, None))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Rejecting {
        seen: Arc<Mutex<Option<KeyState>>>,
    }

    impl CacheCallback for Rejecting {
        fn validate_candidate(&mut self, _key: &str, _state: KeyState, _value: Option<&Bytes>) -> bool {
            false
        }

        fn done(self: Box<Self>, state: KeyState, _value: Option<Bytes>) {
            *self.seen.lock().unwrap() = Some(state);
        }
    }

    #[test]
    fn test_report_rejected_candidate_is_not_found() {
        let seen = Arc::new(Mutex::new(None));
        report(
            Box::new(Rejecting { seen: seen.clone() }),
            "k",
            KeyState::Available,
            Some(Bytes::from_static(b"v")),
        );
        assert_eq!(*seen.lock().unwrap(), Some(KeyState::NotFound));
    }

    #[test]
    fn test_report_available() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        report(
            callback_fn(move |state, value| *sink.lock().unwrap() = Some((state, value))),
            "k",
            KeyState::Available,
            Some(Bytes::from_static(b"v")),
        );
        let got = seen.lock().unwrap().take().unwrap();
        assert_eq!(got.0, KeyState::Available);
        assert_eq!(got.1.unwrap().as_ref(), b"v");
    }

    #[test]
    fn test_report_network_error_drops_value() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        report(
            callback_fn(move |state, value| *sink.lock().unwrap() = Some((state, value))),
            "k",
            KeyState::NetworkError,
            Some(Bytes::from_static(b"v")),
        );
        let got = seen.lock().unwrap().take().unwrap();
        assert_eq!(got.0, KeyState::NetworkError);
        assert!(got.1.is_none());
    }

    #[test]
    fn test_key_state_display() {
        assert_eq!(KeyState::Available.to_string(), "available");
        assert_eq!(KeyState::NotFound.to_string(), "not-found");
        assert_eq!(KeyState::NetworkError.to_string(), "network-error");
    }
}
