//! Key/Value Codec
//!
//! Packs a key and value into one payload so a backend that only sees a
//! hashed or truncated key can still hand back the full original key:
//!
//! ```text
//! +-------+-----+--------+--------+
//! | value | key | len_lo | len_hi |
//! +-------+-----+--------+--------+
//! ```
//!
//! The trailing two bytes are the key length, little-endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Longest key representable in the two-byte length suffix
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

const LEN_SUFFIX: usize = 2;

/// Encode `key` and `value` into a single payload
pub fn encode(key: &str, value: &[u8]) -> Result<Bytes> {
    let key_len = key.len();
    if key_len > MAX_KEY_LEN {
        return Err(Error::KeyTooLong {
            len: key_len,
            max: MAX_KEY_LEN,
        });
    }
    let mut buf = BytesMut::with_capacity(value.len() + key_len + LEN_SUFFIX);
    buf.put_slice(value);
    buf.put_slice(key.as_bytes());
    buf.put_u16_le(key_len as u16);
    Ok(buf.freeze())
}

/// Split a payload back into its key and value.
///
/// The value shares the payload's buffer.
pub fn decode(payload: &Bytes) -> Result<(String, Bytes)> {
    if payload.len() < LEN_SUFFIX {
        return Err(Error::Decode(format!(
            "payload of {} bytes is too short for a key length",
            payload.len()
        )));
    }
    let suffix_start = payload.len() - LEN_SUFFIX;
    let key_len = u16::from_le_bytes([payload[suffix_start], payload[suffix_start + 1]]) as usize;
    if key_len > suffix_start {
        return Err(Error::Decode(format!(
            "key length {} exceeds payload of {} bytes",
            key_len,
            payload.len()
        )));
    }
    let value_len = suffix_start - key_len;
    let key = std::str::from_utf8(&payload[value_len..suffix_start])
        .map_err(|e| Error::Decode(format!("key is not utf-8: {}", e)))?
        .to_string();
    Ok((key, payload.slice(..value_len)))
}

/// Decode `payload` and return the value only if its key is `expected_key`
pub fn decode_for_key(payload: &Bytes, expected_key: &str) -> Option<Bytes> {
    match decode(payload) {
        Ok((key, value)) if key == expected_key => Some(value),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
