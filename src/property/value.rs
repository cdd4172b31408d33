//! Property values and their stability history
//!
//! Each value carries a 64-bit `update_mask`: bit 0 is the most recent write,
//! set when that write changed the body. `num_writes` counts all writes, so
//! stability can be judged on fewer than 64 samples.
//!
//! The persisted form is the [`PropertyValueProto`] record; one cohort is
//! stored as a [`PropertyCacheValues`] list.

use bytes::Bytes;

/// Number of writes tracked by the update mask
pub const UPDATE_MASK_BITS: i64 = 64;

/// Persisted form of a single property
#[derive(Clone, PartialEq, prost::Message)]
pub struct PropertyValueProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub body: Bytes,
    #[prost(int64, tag = "3")]
    pub write_timestamp_ms: i64,
    #[prost(uint64, tag = "4")]
    pub update_mask: u64,
    #[prost(int64, tag = "5")]
    pub num_writes: i64,
}

/// Persisted form of a cohort: every property written together
#[derive(Clone, PartialEq, prost::Message)]
pub struct PropertyCacheValues {
    #[prost(message, repeated, tag = "1")]
    pub value: Vec<PropertyValueProto>,
}

/// In-memory state of one property on a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyValue {
    body: Bytes,
    write_timestamp_ms: i64,
    update_mask: u64,
    num_writes: i64,
    valid: bool,
    was_read: bool,
    changed: bool,
}

impl Default for PropertyValue {
    fn default() -> Self {
        Self {
            body: Bytes::new(),
            write_timestamp_ms: 0,
            update_mask: 0,
            num_writes: 0,
            valid: false,
            was_read: false,
            changed: true,
        }
    }
}

impl PropertyValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a value read from a store
    pub fn from_proto(proto: &PropertyValueProto) -> Self {
        Self {
            body: proto.body.clone(),
            write_timestamp_ms: proto.write_timestamp_ms,
            update_mask: proto.update_mask,
            num_writes: proto.num_writes,
            valid: true,
            was_read: true,
            changed: false,
        }
    }

    /// Persisted form under `name`
    pub fn to_proto(&self, name: &str) -> PropertyValueProto {
        PropertyValueProto {
            name: name.to_string(),
            body: self.body.clone(),
            write_timestamp_ms: self.write_timestamp_ms,
            update_mask: self.update_mask,
            num_writes: self.num_writes,
        }
    }

    /// Record a write of `body` at `now_ms`.
    ///
    /// The first write, and any write whose body differs from the current
    /// one, shifts a 1 into the update mask; an identical write shifts a 0.
    pub fn set_value(&mut self, body: impl Into<Bytes>, now_ms: i64) {
        let body = body.into();
        let changed = !self.valid || body != self.body;
        if changed {
            self.body = body;
            self.valid = true;
        }
        self.changed = true;
        self.update_mask = (self.update_mask << 1) | u64::from(changed);
        self.num_writes += 1;
        self.write_timestamp_ms = now_ms;
    }

    pub fn value(&self) -> &Bytes {
        &self.body
    }

    pub fn write_timestamp_ms(&self) -> i64 {
        self.write_timestamp_ms
    }

    pub fn update_mask(&self) -> u64 {
        self.update_mask
    }

    pub fn num_writes(&self) -> i64 {
        self.num_writes
    }

    /// Whether a body has been read or written
    pub fn has_value(&self) -> bool {
        self.valid
    }

    /// Whether the page's read attempt completed before this value was made
    pub fn was_read(&self) -> bool {
        self.was_read
    }

    pub(crate) fn set_was_read(&mut self, was_read: bool) {
        self.was_read = was_read;
    }

    /// Mutated since the last cohort write
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub(crate) fn clear_changed(&mut self) {
        self.changed = false;
    }

    /// True when fewer than `mutations_per_1000_threshold` of every thousand
    /// recent writes changed the body
    pub fn is_stable(&self, mutations_per_1000_threshold: u32) -> bool {
        let num_writes = self.num_writes.clamp(1, UPDATE_MASK_BITS);
        let num_changes = i64::from(self.update_mask.count_ones());
        let changes_per_1000 = 1000 * num_changes / num_writes;
        changes_per_1000 < i64::from(mutations_per_1000_threshold)
    }

    /// True when none of the last `num_writes_unchanged` writes changed the
    /// body.
    ///
    /// - `num_writes_unchanged < num_writes`: exactly the last
    ///   `num_writes_unchanged` bits of the update mask are checked.
    /// - `num_writes_unchanged >= num_writes`: the last `num_writes - 1` bits
    ///   are checked, so the first write, which always counts as a change,
    ///   is ignored.
    /// - `num_writes_unchanged > 64`: false, the mask cannot tell.
    pub fn is_recently_constant(&self, num_writes_unchanged: u32) -> bool {
        let wanted = i64::from(num_writes_unchanged);
        if wanted > UPDATE_MASK_BITS {
            return false;
        }
        let bits = if wanted >= self.num_writes {
            (self.num_writes - 1).max(0)
        } else {
            wanted
        };
        if bits == 0 {
            return true;
        }
        let low_mask = if bits >= UPDATE_MASK_BITS {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };
        self.update_mask & low_mask == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
