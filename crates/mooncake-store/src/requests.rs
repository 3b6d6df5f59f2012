//! Translating object-level `put`/`get`/`replicate` calls into per-shard
//! `TransferRequest`s (§4.4.1, §4.4.2) and folding a batch's completion
//! statuses back into replica shard status (§4.4.3).

use mooncake_allocator::{BufHandle, ShardStatus};
use mooncake_common::{MooncakeError, MooncakeResult, Opcode, TransferRequest};

use crate::replica::ReplicaStatus;

/// One scatter/gather input or output element: a user pointer and its
/// byte length. `ptr` is an absolute address in the caller's address
/// space, already registered with the transfer engine.
#[derive(Debug, Clone, Copy)]
pub struct IoVec {
    pub ptr: u64,
    pub len: u64,
}

/// Walks `iovecs` and `shards` in lockstep, emitting one `TransferRequest`
/// per overlap between an input element and a shard (§4.4.1). `offset` is
/// the byte position within the shard list to start from -- `0` for a
/// plain put, the read start for a read (after whole-shard skipping has
/// already been applied by the caller, see [`generate_read_requests`]).
fn walk_lockstep(opcode: Opcode, iovecs: &[IoVec], shards: &[&BufHandle], mut shard_offset: u64) -> Vec<TransferRequest> {
    let mut requests = Vec::new();
    let mut shard_idx = 0usize;
    let mut iov_idx = 0usize;
    let mut iov_offset = 0u64;

    while iov_idx < iovecs.len() && shard_idx < shards.len() {
        let iov = iovecs[iov_idx];
        let shard = shards[shard_idx];

        let remaining_in_iov = iov.len - iov_offset;
        let remaining_in_shard = shard.size() - shard_offset;
        if remaining_in_iov == 0 {
            iov_idx += 1;
            iov_offset = 0;
            continue;
        }
        if remaining_in_shard == 0 {
            shard_idx += 1;
            shard_offset = 0;
            continue;
        }

        let to_write = remaining_in_iov.min(remaining_in_shard);
        requests.push(TransferRequest {
            opcode,
            source: iov.ptr + iov_offset,
            target_id: u64::from(shard.segment_id()) as i32,
            target_offset: shard.addr() + shard_offset,
            length: to_write,
        });

        iov_offset += to_write;
        shard_offset += to_write;
    }

    requests
}

/// Write-request generation (§4.4.1): maps `iovecs` (the caller's
/// scatter/gather input) onto `shards` starting at shard 0, offset 0.
/// Every input byte is covered exactly once, provided `Σ iovecs.len == Σ
/// shards.size` -- which holds for a fresh `put` since shard layout is
/// derived from the same total size.
pub fn generate_write_requests(iovecs: &[IoVec], shards: &[&BufHandle]) -> Vec<TransferRequest> {
    walk_lockstep(Opcode::Write, iovecs, shards, 0)
}

/// Read-request generation (§4.4.2): skips whole shards lying entirely
/// before `offset`, then walks the remainder producing requests into
/// `iovecs` until either `Σ iovecs.len` bytes have been placed or the
/// shard list is exhausted (i.e. `offset + Σ iovecs.len > object_size`).
pub fn generate_read_requests(iovecs: &[IoVec], shards: &[&BufHandle], offset: u64) -> MooncakeResult<Vec<TransferRequest>> {
    let mut remaining_skip = offset;
    let mut first_touched = 0usize;
    while first_touched < shards.len() {
        let size = shards[first_touched].size();
        if remaining_skip < size {
            break;
        }
        remaining_skip -= size;
        first_touched += 1;
    }
    if first_touched == shards.len() && remaining_skip > 0 {
        return Err(MooncakeError::InvalidRead(format!(
            "offset {offset} is past the end of the object"
        )));
    }

    let touched = &shards[first_touched..];
    Ok(walk_lockstep(Opcode::Read, iovecs, touched, remaining_skip))
}

/// One submitted request's outcome, as reported by
/// `TransferEngine::get_transfer_status` for its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    Failed,
}

/// Status reconciliation after a batch (§4.4.3): folds `requests` and
/// their parallel `outcomes` back onto `shards`, marking any shard that
/// had a failed request `Failed` and every shard that was touched only
/// by successful requests `Complete`. A shard that failed once stays
/// `Failed` even if a later request into the same shard (from a
/// different part of the same batch) succeeded.
///
/// Returns the replica-level status implied by the shards after folding:
/// `Complete` only if every shard is (still) `Complete`.
pub fn reconcile_shard_statuses(
    requests: &[TransferRequest],
    outcomes: &[RequestOutcome],
    shards: &[&BufHandle],
) -> ReplicaStatus {
    assert_eq!(requests.len(), outcomes.len(), "requests and outcomes must be parallel");

    let mut ever_failed = vec![false; shards.len()];
    let mut touched = vec![false; shards.len()];
    for (request, outcome) in requests.iter().zip(outcomes) {
        if let Some(handle_index) = shard_index_of(request, shards) {
            touched[handle_index] = true;
            if *outcome == RequestOutcome::Failed {
                ever_failed[handle_index] = true;
            }
        }
    }

    for (idx, shard) in shards.iter().enumerate() {
        if ever_failed[idx] {
            shard.set_status(ShardStatus::Failed);
        } else if touched[idx] {
            shard.set_status(ShardStatus::Complete);
        }
    }

    if ever_failed.iter().any(|&f| f) {
        ReplicaStatus::Partial
    } else {
        ReplicaStatus::Complete
    }
}

/// Which shard a request targeted, identified by its absolute base
/// address (the cursor described in §4.4.3 is equivalent to this lookup
/// since requests never cross a shard boundary).
fn shard_index_of(request: &TransferRequest, shards: &[&BufHandle]) -> Option<usize> {
    shards
        .iter()
        .position(|shard| request.target_offset >= shard.addr() && request.target_offset < shard.addr() + shard.size())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooncake_allocator::BufferAllocator;
    use mooncake_common::{BufferIndex, SegmentId};

    fn shard(allocator: &BufferAllocator, size: u64) -> BufHandle {
        allocator.allocate(size).unwrap()
    }

    #[test]
    fn write_requests_cover_every_input_byte_exactly_once() {
        let allocator = BufferAllocator::new(SegmentId::new(1), BufferIndex::new(0), 0, 1 << 20);
        let s0 = shard(&allocator, 100);
        let s1 = shard(&allocator, 100);
        let shards = vec![&s0, &s1];
        let iovecs = vec![IoVec { ptr: 0x1000, len: 60 }, IoVec { ptr: 0x2000, len: 140 }];

        let requests = generate_write_requests(&iovecs, &shards);
        let total: u64 = requests.iter().map(|r| r.length).sum();
        assert_eq!(total, 200);

        for r in &requests {
            assert_eq!(r.opcode, Opcode::Write);
        }
        assert_eq!(requests[0].source, 0x1000);
        assert_eq!(requests[0].length, 60);
        assert_eq!(requests[0].target_offset, s0.addr());

        assert_eq!(requests[1].source, 0x1000 + 60);
        assert_eq!(requests[1].length, 40);
        assert_eq!(requests[1].target_offset, s0.addr() + 60);

        assert_eq!(requests[2].source, 0x2000 + 40);
        assert_eq!(requests[2].length, 100);
        assert_eq!(requests[2].target_offset, s1.addr());
    }

    #[test]
    fn write_requests_never_cross_a_shard_boundary() {
        let allocator = BufferAllocator::new(SegmentId::new(1), BufferIndex::new(0), 0, 1 << 20);
        let s0 = shard(&allocator, 64);
        let s1 = shard(&allocator, 64);
        let shards = vec![&s0, &s1];
        let iovecs = vec![IoVec { ptr: 0x1000, len: 128 }];

        let requests = generate_write_requests(&iovecs, &shards);
        for r in &requests {
            let in_s0 = r.target_offset >= s0.addr() && r.target_offset + r.length <= s0.addr() + s0.size();
            let in_s1 = r.target_offset >= s1.addr() && r.target_offset + r.length <= s1.addr() + s1.size();
            assert!(in_s0 || in_s1);
        }
    }

    #[test]
    fn read_requests_skip_whole_shards_before_offset() {
        let allocator = BufferAllocator::new(SegmentId::new(1), BufferIndex::new(0), 0, 1 << 20);
        let s0 = shard(&allocator, 64);
        let s1 = shard(&allocator, 64);
        let s2 = shard(&allocator, 64);
        let shards = vec![&s0, &s1, &s2];
        let iovecs = vec![IoVec { ptr: 0x9000, len: 32 }];

        let requests = generate_read_requests(&iovecs, &shards, 80).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].opcode, Opcode::Read);
        assert_eq!(requests[0].target_offset, s1.addr() + 16);
        assert_eq!(requests[0].length, 32);
    }

    #[test]
    fn read_requests_truncate_past_object_end() {
        let allocator = BufferAllocator::new(SegmentId::new(1), BufferIndex::new(0), 0, 1 << 20);
        let s0 = shard(&allocator, 64);
        let shards = vec![&s0];
        let iovecs = vec![IoVec { ptr: 0x9000, len: 128 }];

        let requests = generate_read_requests(&iovecs, &shards, 0).unwrap();
        let total: u64 = requests.iter().map(|r| r.length).sum();
        assert_eq!(total, 64);
    }

    #[test]
    fn read_requests_offset_past_end_errors() {
        let allocator = BufferAllocator::new(SegmentId::new(1), BufferIndex::new(0), 0, 1 << 20);
        let s0 = shard(&allocator, 64);
        let shards = vec![&s0];
        let iovecs = vec![IoVec { ptr: 0x9000, len: 10 }];
        assert!(generate_read_requests(&iovecs, &shards, 64).is_err());
    }

    #[test]
    fn reconcile_marks_failed_shard_and_replica_partial() {
        let allocator = BufferAllocator::new(SegmentId::new(1), BufferIndex::new(0), 0, 1 << 20);
        let s0 = shard(&allocator, 64);
        let s1 = shard(&allocator, 64);
        let shards = vec![&s0, &s1];
        let iovecs = vec![IoVec { ptr: 0x9000, len: 128 }];
        let requests = generate_write_requests(&iovecs, &shards);
        let outcomes = vec![RequestOutcome::Success, RequestOutcome::Failed];

        let status = reconcile_shard_statuses(&requests, &outcomes, &shards);
        assert_eq!(status, ReplicaStatus::Partial);
        assert_eq!(s0.status(), ShardStatus::Complete);
        assert_eq!(s1.status(), ShardStatus::Failed);
    }

    #[test]
    fn reconcile_all_success_marks_complete() {
        let allocator = BufferAllocator::new(SegmentId::new(1), BufferIndex::new(0), 0, 1 << 20);
        let s0 = shard(&allocator, 64);
        let shards = vec![&s0];
        let iovecs = vec![IoVec { ptr: 0x9000, len: 64 }];
        let requests = generate_write_requests(&iovecs, &shards);
        let outcomes = vec![RequestOutcome::Success];

        let status = reconcile_shard_statuses(&requests, &outcomes, &shards);
        assert_eq!(status, ReplicaStatus::Complete);
        assert_eq!(s0.status(), ShardStatus::Complete);
    }

    #[test]
    fn reconcile_later_success_does_not_unfail_a_failed_shard() {
        let allocator = BufferAllocator::new(SegmentId::new(1), BufferIndex::new(0), 0, 1 << 20);
        let s0 = shard(&allocator, 64);
        let shards = vec![&s0];
        // Two requests land in the same shard: first fails, second succeeds.
        let requests = vec![
            TransferRequest { opcode: Opcode::Write, source: 0x1, target_id: 1, target_offset: s0.addr(), length: 32 },
            TransferRequest {
                opcode: Opcode::Write,
                source: 0x2,
                target_id: 1,
                target_offset: s0.addr() + 32,
                length: 32,
            },
        ];
        let outcomes = vec![RequestOutcome::Failed, RequestOutcome::Success];

        let status = reconcile_shard_statuses(&requests, &outcomes, &shards);
        assert_eq!(status, ReplicaStatus::Partial);
        assert_eq!(s0.status(), ShardStatus::Failed);
    }
}
