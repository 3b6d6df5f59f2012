//! Free-list bookkeeping shared between a [`crate::BufferAllocator`] and
//! the [`crate::BufHandle`]s it issues.

use std::sync::Mutex;

use mooncake_common::{BufferIndex, SegmentId};

pub(crate) struct AllocatorCore {
    segment_id: SegmentId,
    buffer_index: BufferIndex,
    base: u64,
    total: u64,
    free: Mutex<Vec<(u64, u64)>>,
}

impl AllocatorCore {
    pub(crate) fn new(segment_id: SegmentId, buffer_index: BufferIndex, base: u64, total: u64) -> Self {
        Self {
            segment_id,
            buffer_index,
            base,
            total,
            free: Mutex::new(vec![(base, total)]),
        }
    }

    pub(crate) fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub(crate) fn buffer_index(&self) -> BufferIndex {
        self.buffer_index
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    /// First-fit allocation from the free list. Returns `None` if no
    /// single free range can satisfy `size`.
    pub(crate) fn try_allocate(&self, size: u64) -> Option<u64> {
        let mut free = self.free.lock().expect("allocator free-list lock poisoned");
        let idx = free.iter().position(|&(_, len)| len >= size)?;
        let (start, len) = free[idx];
        if len == size {
            free.remove(idx);
        } else {
            free[idx] = (start + size, len - size);
        }
        Some(start)
    }

    /// Returns a `[addr, addr+size)` range to the free list, coalescing
    /// with adjacent ranges so `remaining()` stays accurate across
    /// repeated allocate/free cycles.
    pub(crate) fn free_range(&self, addr: u64, size: u64) {
        let mut free = self.free.lock().expect("allocator free-list lock poisoned");
        free.push((addr, size));
        free.sort_unstable_by_key(|&(start, _)| start);

        let mut coalesced: Vec<(u64, u64)> = Vec::with_capacity(free.len());
        for &(start, len) in free.iter() {
            match coalesced.last_mut() {
                Some(&mut (last_start, ref mut last_len)) if last_start + *last_len == start => {
                    *last_len += len;
                }
                _ => coalesced.push((start, len)),
            }
        }
        *free = coalesced;
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.free
            .lock()
            .expect("allocator free-list lock poisoned")
            .iter()
            .map(|&(_, len)| len)
            .sum()
    }
}
