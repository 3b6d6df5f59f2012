//! `BufHandle`: a shard's location plus an owning back-reference to the
//! allocator that issued it.
//!
//! Per the design note on back-pointers: the handle holds a strong,
//! reference-counted reference to the allocator so dropping the last
//! handle returns its range automatically; the allocator in turn keeps
//! only weak references to outstanding handles, used solely to sweep
//! them to `Unregistered` on `unregister`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use mooncake_common::{BufferIndex, SegmentId};

use crate::core::AllocatorCore;

/// Status of a shard's backing handle (§3 `BufHandle`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    Init,
    Complete,
    Failed,
    Unregistered,
}

impl ShardStatus {
    fn to_tag(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Complete => 1,
            Self::Failed => 2,
            Self::Unregistered => 3,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            1 => Self::Complete,
            2 => Self::Failed,
            3 => Self::Unregistered,
            _ => Self::Init,
        }
    }
}

pub(crate) struct HandleInner {
    segment_id: SegmentId,
    buffer_index: BufferIndex,
    addr: u64,
    size: u64,
    status: AtomicU8,
    freed: AtomicBool,
    allocator: Arc<AllocatorCore>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if !self.freed.swap(true, Ordering::AcqRel) {
            self.allocator.free_range(self.addr, self.size);
        }
    }
}

/// A shard's location: owning segment, absolute address, size, status,
/// and (internally) the allocator that must reclaim its range.
#[derive(Clone)]
pub struct BufHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for BufHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufHandle")
            .field("segment_id", &self.segment_id())
            .field("buffer_index", &self.buffer_index())
            .field("addr", &self.addr())
            .field("size", &self.size())
            .field("status", &self.status())
            .finish()
    }
}

impl BufHandle {
    pub(crate) fn new(
        segment_id: SegmentId,
        buffer_index: BufferIndex,
        addr: u64,
        size: u64,
        allocator: Arc<AllocatorCore>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                segment_id,
                buffer_index,
                addr,
                size,
                status: AtomicU8::new(ShardStatus::Init.to_tag()),
                freed: AtomicBool::new(false),
                allocator,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<HandleInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn segment_id(&self) -> SegmentId {
        self.inner.segment_id
    }

    pub fn buffer_index(&self) -> BufferIndex {
        self.inner.buffer_index
    }

    pub fn addr(&self) -> u64 {
        self.inner.addr
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn status(&self) -> ShardStatus {
        ShardStatus::from_tag(self.inner.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ShardStatus) {
        self.inner.status.store(status.to_tag(), Ordering::Release);
    }

    /// Returns true if this is the same underlying allocation as `other`.
    pub fn same_allocation(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Explicitly returns this handle's range to its allocator. Idempotent:
    /// a handle already freed (explicitly, or via drop of the last clone)
    /// is a no-op.
    pub fn deallocate(&self) {
        if !self.inner.freed.swap(true, Ordering::AcqRel) {
            self.inner.allocator.free_range(self.inner.addr, self.inner.size);
        }
    }
}

/// Upgrades a weak handle reference, marks it `Unregistered`, and returns
/// it as an owned [`BufHandle`] for the caller to re-home. Returns `None`
/// if every strong reference to the handle has already been dropped.
pub(crate) fn upgrade_and_mark_unregistered(weak: &std::sync::Weak<HandleInner>) -> Option<BufHandle> {
    let inner = weak.upgrade()?;
    inner
        .status
        .store(ShardStatus::Unregistered.to_tag(), Ordering::Release);
    Some(BufHandle { inner })
}
