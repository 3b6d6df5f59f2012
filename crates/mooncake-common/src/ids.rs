//! Opaque identifiers.
//!
//! Per §9's design note on "two variants of segment id", a transport-local
//! [`SegmentId`] (assigned by [`crate::descriptor`] / the metadata client's
//! lazy cache) and a replica-allocator-local [`BufferIndex`] (assigned by
//! `register_buffer`) are kept as distinct types. Crossing the boundary
//! between them requires an explicit lookup, never an implicit cast.

use std::fmt;

/// Transport-local segment identifier, assigned by
/// `MetadataClient::get_segment_id`'s lazy cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SegmentId(u64);

impl SegmentId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SegmentId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SegmentId> for u64 {
    fn from(id: SegmentId) -> Self {
        id.0
    }
}

/// Replica-allocator-local index of a `(segment, base, length)` buffer
/// allocator, assigned by `ReplicaAllocator::register_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BufferIndex(u64);

impl BufferIndex {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for BufferIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BufferIndex {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<BufferIndex> for u64 {
    fn from(id: BufferIndex) -> Self {
        id.0
    }
}

/// A monotonically increasing object version within one replica allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(u64);

impl Version {
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(v: Version) -> Self {
        v.0
    }
}

/// A replica identifier, unique within `(key, version)` and never reused
/// after removal (§4.3 invariant 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ReplicaId(u64);

impl ReplicaId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ReplicaId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ReplicaId> for u64 {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

/// Handle for a bounded group of outstanding transfer requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BatchId(u64);

impl BatchId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BatchId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<BatchId> for u64 {
    fn from(id: BatchId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_id_and_buffer_index_are_distinct_types() {
        let seg = SegmentId::new(3);
        let buf = BufferIndex::new(3);
        assert_eq!(u64::from(seg), u64::from(buf));
        // The point of the test is that the above compiles only because
        // both sides are first converted to u64 -- SegmentId and
        // BufferIndex do not implement PartialEq against each other.
    }

    #[test]
    fn version_next_is_monotonic() {
        let v0 = Version::zero();
        let v1 = v0.next();
        let v2 = v1.next();
        assert!(v1 > v0);
        assert!(v2 > v1);
    }

    #[test]
    fn replica_id_next_never_repeats() {
        let mut id = ReplicaId::new(0);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            assert!(seen.insert(id));
            id = id.next();
        }
    }
}
