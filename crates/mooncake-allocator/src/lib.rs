//! A bump/slab allocator bound to one `(segment, base, length)` memory
//! range (§4.2). One instance exists per registered buffer; the replica
//! allocator holds one of these per `(segment_id, buffer_index)` pair.

mod core;
mod handle;

use std::sync::{Arc, Mutex, Weak};

use mooncake_common::{BufferIndex, MooncakeError, MooncakeResult, SegmentId};

use self::core::AllocatorCore;
use self::handle::upgrade_and_mark_unregistered;

pub use handle::{BufHandle, ShardStatus};

/// The contract a shard allocator must satisfy (§4.2): successful handles
/// never overlap, and each handle is freed exactly once. Kept as a trait
/// so a size-class allocator could stand in for [`BufferAllocator`]
/// without changing callers.
pub trait ShardAllocator: Send + Sync {
    fn allocate(&self, size: u64) -> MooncakeResult<BufHandle>;
    fn deallocate(&self, handle: &BufHandle);
    fn remaining(&self) -> u64;
    fn segment_id(&self) -> SegmentId;
    fn buffer_index(&self) -> BufferIndex;
}

/// First-fit, coalescing-free-list allocator over one contiguous range.
pub struct BufferAllocator {
    core: Arc<AllocatorCore>,
    issued: Mutex<Vec<Weak<handle::HandleInner>>>,
}

impl BufferAllocator {
    /// Creates an allocator managing `[base, base+length)` on `segment_id`,
    /// registered under `buffer_index` by the replica allocator.
    pub fn new(segment_id: SegmentId, buffer_index: BufferIndex, base: u64, length: u64) -> Self {
        Self {
            core: Arc::new(AllocatorCore::new(segment_id, buffer_index, base, length)),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.core.total()
    }

    /// Marks every still-live handle issued by this allocator
    /// `Unregistered` and returns them so the caller (the replica
    /// allocator's `unregister`) can re-home the shards they name. The
    /// allocator itself should be taken out of service by the caller
    /// after this returns.
    pub fn sweep_unregister(&self) -> Vec<BufHandle> {
        let issued = self.issued.lock().expect("issued-handle list lock poisoned");
        issued
            .iter()
            .filter_map(upgrade_and_mark_unregistered)
            .collect()
    }
}

impl ShardAllocator for BufferAllocator {
    fn allocate(&self, size: u64) -> MooncakeResult<BufHandle> {
        if size == 0 {
            return Err(MooncakeError::invalid_argument("allocate(0) is not permitted"));
        }
        let addr = self.core.try_allocate(size).ok_or_else(|| {
            MooncakeError::BufferOverflow {
                requested: size,
                remaining: self.core.remaining(),
            }
        })?;
        let handle = BufHandle::new(
            self.core.segment_id(),
            self.core.buffer_index(),
            addr,
            size,
            Arc::clone(&self.core),
        );
        self.issued
            .lock()
            .expect("issued-handle list lock poisoned")
            .push(handle.downgrade());
        Ok(handle)
    }

    fn deallocate(&self, handle: &BufHandle) {
        handle.deallocate();
    }

    fn remaining(&self) -> u64 {
        self.core.remaining()
    }

    fn segment_id(&self) -> SegmentId {
        self.core.segment_id()
    }

    fn buffer_index(&self) -> BufferIndex {
        self.core.buffer_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> BufferAllocator {
        BufferAllocator::new(SegmentId::new(1), BufferIndex::new(0), 0, 1024)
    }

    #[test]
    fn allocate_does_not_overlap() {
        let alloc = allocator();
        let a = alloc.allocate(256).unwrap();
        let b = alloc.allocate(256).unwrap();
        assert!(a.addr() + a.size() <= b.addr() || b.addr() + b.size() <= a.addr());
    }

    #[test]
    fn remaining_tracks_allocations() {
        let alloc = allocator();
        assert_eq!(alloc.remaining(), 1024);
        let _h = alloc.allocate(300).unwrap();
        assert_eq!(alloc.remaining(), 724);
    }

    #[test]
    fn overflow_reports_remaining() {
        let alloc = allocator();
        let err = alloc.allocate(2048).unwrap_err();
        match err {
            MooncakeError::BufferOverflow { requested, remaining } => {
                assert_eq!(requested, 2048);
                assert_eq!(remaining, 1024);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn drop_of_last_handle_returns_range() {
        let alloc = allocator();
        {
            let _h = alloc.allocate(1024).unwrap();
            assert_eq!(alloc.remaining(), 0);
        }
        assert_eq!(alloc.remaining(), 1024);
    }

    #[test]
    fn explicit_deallocate_is_idempotent() {
        let alloc = allocator();
        let h = alloc.allocate(512).unwrap();
        alloc.deallocate(&h);
        alloc.deallocate(&h);
        assert_eq!(alloc.remaining(), 1024);
    }

    #[test]
    fn deallocate_then_drop_does_not_double_free() {
        let alloc = allocator();
        let h = alloc.allocate(512).unwrap();
        h.deallocate();
        assert_eq!(alloc.remaining(), 1024);
        drop(h);
        assert_eq!(alloc.remaining(), 1024);
    }

    #[test]
    fn coalescing_reclaims_full_range_after_round_trip() {
        let alloc = allocator();
        let a = alloc.allocate(200).unwrap();
        let b = alloc.allocate(200).unwrap();
        let c = alloc.allocate(200).unwrap();
        drop(b);
        drop(a);
        drop(c);
        assert_eq!(alloc.remaining(), 1024);
        // A subsequent allocation for the full range should now succeed.
        let whole = alloc.allocate(1024);
        assert!(whole.is_ok());
    }

    #[test]
    fn sweep_unregister_marks_live_handles() {
        let alloc = allocator();
        let h1 = alloc.allocate(100).unwrap();
        let h2 = alloc.allocate(100).unwrap();
        drop(h2);
        let swept = alloc.sweep_unregister();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].status(), ShardStatus::Unregistered);
        assert_eq!(h1.status(), ShardStatus::Unregistered);
    }

    #[test]
    fn zero_size_allocation_rejected() {
        let alloc = allocator();
        assert!(alloc.allocate(0).is_err());
    }
}
