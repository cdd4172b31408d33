//! Fallback Cache - Size-split composition of two backends
//!
//! Backends such as memcached reject large values. This layer keeps small
//! entries in the `small` backend and routes the rest to `large`, leaving a
//! one-byte forwarding marker behind:
//!
//! - `len(key) + len(value) <= threshold`: small holds `value || 'S'`
//! - otherwise: small holds `'L'`, large holds the key/value codec payload
//!
//! A large payload is only returned if its embedded key matches the request,
//! so backends that hash or truncate keys cannot serve another key's value.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use super::codec;
use super::interface::{report, Cache, CacheCallback, KeyCallback, KeyState};

const SMALL_MARKER: u8 = b'S';
const LARGE_MARKER: u8 = b'L';

/// Cache that splits entries between two backends by size
pub struct FallbackCache {
    small: Arc<dyn Cache>,
    large: Arc<dyn Cache>,
    threshold_bytes: usize,
}

impl FallbackCache {
    /// Create a fallback cache; entries whose key plus value exceed
    /// `threshold_bytes` go to `large`
    pub fn new(small: Arc<dyn Cache>, large: Arc<dyn Cache>, threshold_bytes: usize) -> Self {
        Self {
            small,
            large,
            threshold_bytes,
        }
    }

    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    fn wrap(&self, key: &str, callback: Box<dyn CacheCallback>) -> Box<dyn CacheCallback> {
        Box::new(SmallCallback {
            key: key.to_string(),
            large: Arc::clone(&self.large),
            callback,
            validated: false,
        })
    }
}

/// Split a small-tier payload into its marker and body
fn split_marker(payload: &Bytes) -> Option<(u8, Bytes)> {
    let (&marker, _) = payload.split_last()?;
    Some((marker, payload.slice(..payload.len() - 1)))
}

struct SmallCallback {
    key: String,
    large: Arc<dyn Cache>,
    callback: Box<dyn CacheCallback>,
    validated: bool,
}

impl CacheCallback for SmallCallback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        match value.and_then(split_marker) {
            Some((SMALL_MARKER, body)) => {
                self.validated = self.callback.validate_candidate(key, state, Some(&body));
                self.validated
            }
            // The real value lives in the large tier and is validated there
            Some((LARGE_MARKER, body)) => body.is_empty(),
            _ => false,
        }
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        let SmallCallback {
            key,
            large,
            callback,
            validated,
        } = *self;

        if state != KeyState::Available {
            report(callback, &key, state, None);
            return;
        }

        match value.as_ref().and_then(split_marker) {
            Some((SMALL_MARKER, body)) => {
                if validated {
                    callback.done(KeyState::Available, Some(body));
                } else {
                    report(callback, &key, KeyState::Available, Some(body));
                }
            }
            Some((LARGE_MARKER, body)) if body.is_empty() => {
                trace!(key = %key, "fallback cache forwarding to large backend");
                let large_callback = Box::new(LargeCallback {
                    key: key.clone(),
                    callback,
                    validated: false,
                });
                large.get(&key, large_callback);
            }
            _ => {
                warn!(key = %key, "fallback cache found a payload without a valid marker");
                report(callback, &key, KeyState::NotFound, None);
            }
        }
    }
}

struct LargeCallback {
    key: String,
    callback: Box<dyn CacheCallback>,
    validated: bool,
}

impl CacheCallback for LargeCallback {
    fn validate_candidate(&mut self, key: &str, state: KeyState, value: Option<&Bytes>) -> bool {
        match value.and_then(|payload| codec::decode_for_key(payload, &self.key)) {
            Some(body) => {
                self.validated = self.callback.validate_candidate(key, state, Some(&body));
                self.validated
            }
            None => false,
        }
    }

    fn done(self: Box<Self>, state: KeyState, value: Option<Bytes>) {
        let LargeCallback {
            key,
            callback,
            validated,
        } = *self;

        if state != KeyState::Available {
            report(callback, &key, state, None);
            return;
        }
        match value.and_then(|payload| codec::decode_for_key(&payload, &key)) {
            Some(body) if validated => callback.done(KeyState::Available, Some(body)),
            Some(body) => report(callback, &key, KeyState::Available, Some(body)),
            None => {
                warn!(key = %key, "fallback cache large payload does not match its key");
                report(callback, &key, KeyState::NotFound, None);
            }
        }
    }
}

impl Cache for FallbackCache {
    fn get(&self, key: &str, callback: Box<dyn CacheCallback>) {
        self.small.get(key, self.wrap(key, callback));
    }

    fn multi_get(&self, requests: Vec<KeyCallback>) {
        let wrapped = requests
            .into_iter()
            .map(|request| {
                let callback = self.wrap(&request.key, request.callback);
                KeyCallback::new(request.key, callback)
            })
            .collect();
        self.small.multi_get(wrapped);
    }

    fn put(&self, key: &str, value: Bytes) {
        if key.len() + value.len() <= self.threshold_bytes {
            let mut buf = BytesMut::with_capacity(value.len() + 1);
            buf.put_slice(&value);
            buf.put_u8(SMALL_MARKER);
            self.small.put(key, buf.freeze());
            return;
        }

        match codec::encode(key, &value) {
            Ok(payload) => {
                self.large.put(key, payload);
                self.small.put(key, Bytes::from_static(&[LARGE_MARKER]));
            }
            Err(e) => warn!(key_len = key.len(), error = %e, "fallback cache dropping put"),
        }
    }

    fn delete(&self, key: &str) {
        self.small.delete(key);
        self.large.delete(key);
    }

    fn name(&self) -> String {
        format!("Fallback_{}:{}", self.small.name(), self.large.name())
    }

    fn is_blocking(&self) -> bool {
        self.small.is_blocking() && self.large.is_blocking()
    }

    fn is_healthy(&self) -> bool {
        self.small.is_healthy() && self.large.is_healthy()
    }

    fn shut_down(&self) {
        self.small.shut_down();
        self.large.shut_down();
    }
}

// =============================================================================
// Tests
// =============================================================================
