//! Allocation strategy variant interface (§4.3): how the replica
//! allocator chooses a segment for a new shard, and how it chooses which
//! replica's handle serves a given shard position on read.
//!
//! A small, side-effect-free routing object queried by the allocator
//! rather than driving allocation itself.

use std::collections::HashSet;
use std::sync::Mutex;

use mooncake_common::{MooncakeError, MooncakeResult, ReplicaId, SegmentId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One candidate for [`AllocationStrategy::select_handle`]: the replica
/// it belongs to, and the handle itself at the shard position under
/// consideration.
pub struct HandleCandidate<'a> {
    pub replica_id: ReplicaId,
    pub handle: &'a mooncake_allocator::BufHandle,
}

pub trait AllocationStrategy: Send + Sync {
    /// Picks one segment from `candidates` for the next shard of a
    /// replica being built. `existing` names segments already used by
    /// other shards of the *same* replica (avoid when possible);
    /// `failed` names segments that must never be picked (already tried
    /// and found unable to satisfy this shard).
    fn select_segment(
        &self,
        candidates: &[SegmentId],
        existing: &HashSet<SegmentId>,
        failed: &HashSet<SegmentId>,
    ) -> MooncakeResult<SegmentId>;

    /// Picks one handle from `candidates` to serve a single shard
    /// position during [`crate::ReplicaAllocator::get_one_replica`].
    /// `failed` names replicas whose handle at this position has already
    /// been tried and found unusable.
    fn select_handle<'a>(
        &self,
        candidates: &[HandleCandidate<'a>],
        failed: &HashSet<ReplicaId>,
    ) -> MooncakeResult<&'a mooncake_allocator::BufHandle>;
}

/// Default strategy (§4.3): uniform random selection among eligible
/// options, with a configurable seed.
pub struct RandomStrategy {
    rng: Mutex<StdRng>,
}

impl RandomStrategy {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl AllocationStrategy for RandomStrategy {
    fn select_segment(
        &self,
        candidates: &[SegmentId],
        existing: &HashSet<SegmentId>,
        failed: &HashSet<SegmentId>,
    ) -> MooncakeResult<SegmentId> {
        let eligible: Vec<SegmentId> = candidates.iter().copied().filter(|s| !failed.contains(s)).collect();
        if eligible.is_empty() {
            return Err(MooncakeError::AvailableSegmentEmpty(0));
        }

        // Prefer a segment not already used by this replica; fall back
        // to any eligible segment if that would leave nothing to pick.
        let preferred: Vec<SegmentId> = eligible.iter().copied().filter(|s| !existing.contains(s)).collect();
        let pool = if preferred.is_empty() { &eligible } else { &preferred };

        let mut rng = self.rng.lock().expect("strategy rng lock poisoned");
        let idx = rng.gen_range(0..pool.len());
        Ok(pool[idx])
    }

    fn select_handle<'a>(
        &self,
        candidates: &[HandleCandidate<'a>],
        failed: &HashSet<ReplicaId>,
    ) -> MooncakeResult<&'a mooncake_allocator::BufHandle> {
        let eligible: Vec<&HandleCandidate<'a>> =
            candidates.iter().filter(|c| !failed.contains(&c.replica_id)).collect();
        if eligible.is_empty() {
            return Err(MooncakeError::NoAvailableHandle(0));
        }
        let mut rng = self.rng.lock().expect("strategy rng lock poisoned");
        let idx = rng.gen_range(0..eligible.len());
        Ok(eligible[idx].handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_segment_avoids_failed() {
        let strategy = RandomStrategy::new(1);
        let candidates = vec![SegmentId::new(1), SegmentId::new(2)];
        let mut failed = HashSet::new();
        failed.insert(SegmentId::new(1));
        for _ in 0..20 {
            let chosen = strategy.select_segment(&candidates, &HashSet::new(), &failed).unwrap();
            assert_eq!(chosen, SegmentId::new(2));
        }
    }

    #[test]
    fn select_segment_prefers_unused_by_this_replica() {
        let strategy = RandomStrategy::new(2);
        let candidates = vec![SegmentId::new(1), SegmentId::new(2)];
        let mut existing = HashSet::new();
        existing.insert(SegmentId::new(1));
        for _ in 0..20 {
            let chosen = strategy.select_segment(&candidates, &existing, &HashSet::new()).unwrap();
            assert_eq!(chosen, SegmentId::new(2));
        }
    }

    #[test]
    fn select_segment_falls_back_when_all_used_by_replica() {
        let strategy = RandomStrategy::new(3);
        let candidates = vec![SegmentId::new(1)];
        let mut existing = HashSet::new();
        existing.insert(SegmentId::new(1));
        // Only one segment exists and it's already used by this replica;
        // there is nowhere else to go, so it's still returned.
        assert_eq!(
            strategy.select_segment(&candidates, &existing, &HashSet::new()).unwrap(),
            SegmentId::new(1)
        );
    }

    #[test]
    fn select_segment_empty_candidates_errors() {
        let strategy = RandomStrategy::new(4);
        let err = strategy.select_segment(&[], &HashSet::new(), &HashSet::new()).unwrap_err();
        assert!(matches!(err, MooncakeError::AvailableSegmentEmpty(_)));
    }

    #[test]
    fn device_selection_fairness_over_many_draws() {
        // Statistical fairness check mirroring §8's device-selection
        // property, applied here to segment selection instead.
        let strategy = RandomStrategy::new(42);
        let candidates = vec![SegmentId::new(1), SegmentId::new(2)];
        let mut counts = [0u32; 2];
        for _ in 0..10_000 {
            let chosen = strategy.select_segment(&candidates, &HashSet::new(), &HashSet::new()).unwrap();
            if chosen == SegmentId::new(1) {
                counts[0] += 1;
            } else {
                counts[1] += 1;
            }
        }
        let ratio = f64::from(counts[0]) / 10_000.0;
        assert!((0.45..0.55).contains(&ratio), "ratio was {ratio}");
    }
}
