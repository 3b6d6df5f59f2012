//! The replica allocator (§4.3): sharded object layout, buffer-allocator
//! pools per memory segment, and recovery/reassignment when segments are
//! unregistered or shards fail.
//!
//! Every operation is internally serialized on the per-object metadata
//! it touches with a shared/exclusive lock, as specified in §5's
//! concurrency model: all reads take the shared form, all mutations take
//! the exclusive form.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use mooncake_allocator::{BufHandle, BufferAllocator, ShardAllocator, ShardStatus};
use mooncake_common::{BufferIndex, MooncakeError, MooncakeResult, ReplicaId, SegmentId, Version};

use crate::replica::{ReplicaInfo, ReplicaStatus, VersionInfo, VersionList};
use crate::strategy::{AllocationStrategy, HandleCandidate};

/// Default shard size (§8 seed scenarios use 64 KiB throughout).
pub const DEFAULT_SHARD_SIZE: u64 = 64 * 1024;

/// Bound on segment-selection retries per shard before giving up with
/// `AvailableSegmentEmpty` (§4.3: "e.g. 30").
const MAX_SEGMENT_RETRIES: usize = 30;

/// Splits `object_size` into `ceil(object_size / shard_size)` shards,
/// the last one truncated to whatever remains (§4.3 invariant 2, 3).
pub fn shard_sizes_for(object_size: u64, shard_size: u64) -> Vec<u64> {
    let mut sizes = Vec::new();
    let mut remaining = object_size;
    while remaining > 0 {
        let this = remaining.min(shard_size);
        sizes.push(this);
        remaining -= this;
    }
    sizes
}

/// Per-object versioned replica metadata plus the buffer-allocator pools
/// backing every registered segment (§3 "Ownership summary").
pub struct ReplicaAllocator {
    shard_size: u64,
    buffers: RwLock<BTreeMap<BufferIndex, Arc<BufferAllocator>>>,
    next_buffer_index: AtomicU64,
    objects: RwLock<HashMap<String, Arc<RwLock<VersionList>>>>,
}

impl ReplicaAllocator {
    pub fn new(shard_size: u64) -> Self {
        Self {
            shard_size,
            buffers: RwLock::new(BTreeMap::new()),
            next_buffer_index: AtomicU64::new(0),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_default_shard_size() -> Self {
        Self::new(DEFAULT_SHARD_SIZE)
    }

    pub fn shard_size(&self) -> u64 {
        self.shard_size
    }

    fn version_list_for(&self, key: &str) -> Arc<RwLock<VersionList>> {
        if let Some(vl) = self.objects.read().expect("object table lock poisoned").get(key) {
            return Arc::clone(vl);
        }
        Arc::clone(
            self.objects
                .write()
                .expect("object table lock poisoned")
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(VersionList::default()))),
        )
    }

    fn existing_version_list(&self, key: &str) -> MooncakeResult<Arc<RwLock<VersionList>>> {
        self.objects
            .read()
            .expect("object table lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| MooncakeError::InvalidKey(key.to_string()))
    }

    // ---- buffer allocator pool ------------------------------------

    /// Creates a new buffer allocator for `[base, base+length)` on
    /// `segment_id`, returning the index the replica allocator will
    /// reference it by.
    pub fn register_buffer(&self, segment_id: SegmentId, base: u64, length: u64) -> BufferIndex {
        let index = BufferIndex::new(self.next_buffer_index.fetch_add(1, Ordering::Relaxed));
        let allocator = Arc::new(BufferAllocator::new(segment_id, index, base, length));
        self.buffers
            .write()
            .expect("buffer allocator table lock poisoned")
            .insert(index, allocator);
        index
    }

    /// Marks every outstanding handle from `buffer_index` `Unregistered`
    /// and takes the allocator out of service, returning the handles so
    /// the caller (typically followed by [`Self::recovery`]) can
    /// re-home the shards they named.
    pub fn unregister(&self, segment_id: SegmentId, buffer_index: BufferIndex) -> MooncakeResult<Vec<BufHandle>> {
        let allocator = self
            .buffers
            .write()
            .expect("buffer allocator table lock poisoned")
            .remove(&buffer_index)
            .ok_or_else(|| MooncakeError::invalid_argument(format!("unknown buffer index {buffer_index}")))?;
        if allocator.segment_id() != segment_id {
            return Err(MooncakeError::invalid_argument(format!(
                "buffer index {buffer_index} belongs to segment {}, not {segment_id}",
                allocator.segment_id()
            )));
        }
        Ok(allocator.sweep_unregister())
    }

    /// Drains every registered buffer allocator's outstanding handles,
    /// marking them `Unregistered`. Ambient lifecycle helper for
    /// process shutdown (not a named spec operation).
    pub fn shutdown(&self) {
        for allocator in self.buffers.read().expect("buffer allocator table lock poisoned").values() {
            allocator.sweep_unregister();
        }
    }

    fn candidate_segments(&self) -> Vec<SegmentId> {
        let buffers = self.buffers.read().expect("buffer allocator table lock poisoned");
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for allocator in buffers.values() {
            if seen.insert(allocator.segment_id()) {
                out.push(allocator.segment_id());
            }
        }
        out
    }

    /// First-fit allocation of `size` bytes among the buffer allocators
    /// registered for `segment_id`, in buffer-index order (§9 design
    /// note on `allocateShard`).
    fn allocate_in_segment(&self, segment_id: SegmentId, size: u64) -> Option<BufHandle> {
        let buffers = self.buffers.read().expect("buffer allocator table lock poisoned");
        for allocator in buffers.values() {
            if allocator.segment_id() == segment_id {
                if let Ok(handle) = allocator.allocate(size) {
                    return Some(handle);
                }
            }
        }
        None
    }

    /// Allocates one shard of `size` bytes, avoiding `avoid` segments
    /// when possible (§4.3 `select_segment`'s "avoid same-replica
    /// segment" rule), retrying up to [`MAX_SEGMENT_RETRIES`] times.
    fn allocate_one_shard(
        &self,
        size: u64,
        avoid: &HashSet<SegmentId>,
        strategy: &dyn AllocationStrategy,
    ) -> MooncakeResult<BufHandle> {
        let candidates = self.candidate_segments();
        if candidates.is_empty() {
            return Err(MooncakeError::AvailableSegmentEmpty(0));
        }
        let mut failed_segments: HashSet<SegmentId> = HashSet::new();
        for attempt in 0..MAX_SEGMENT_RETRIES {
            let segment = strategy.select_segment(&candidates, avoid, &failed_segments)?;
            if let Some(handle) = self.allocate_in_segment(segment, size) {
                return Ok(handle);
            }
            failed_segments.insert(segment);
            if failed_segments.len() >= candidates.len() {
                return Err(MooncakeError::BufferOverflow {
                    requested: size,
                    remaining: 0,
                });
            }
            let _ = attempt;
        }
        Err(MooncakeError::AvailableSegmentEmpty(MAX_SEGMENT_RETRIES))
    }

    // ---- replica lifecycle ------------------------------------------

    /// Creates a new replica for `key` (§4.3 `add_one_replica`). If
    /// `version` is `None`, allocates a fresh monotonic version sized by
    /// `object_size`; otherwise reuses the existing version's shard
    /// layout and `object_size` must be `None`.
    pub fn add_one_replica(
        &self,
        key: &str,
        version: Option<Version>,
        object_size: Option<u64>,
        strategy: &dyn AllocationStrategy,
    ) -> MooncakeResult<(Version, ReplicaId)> {
        let version_list = self.version_list_for(key);
        let mut vl = version_list.write().expect("version list lock poisoned");

        let (version, shard_sizes) = match version {
            Some(v) => {
                if object_size.is_some() {
                    return Err(MooncakeError::invalid_argument(
                        "object_size must be unset when reusing an existing version",
                    ));
                }
                let info = vl
                    .versions
                    .get(&v)
                    .ok_or_else(|| MooncakeError::InvalidVersion { key: key.to_string(), version: Some(v.into()) })?;
                (v, info.shard_sizes.clone())
            }
            None => {
                let size = object_size
                    .ok_or_else(|| MooncakeError::invalid_argument("object_size is required to create a new version"))?;
                if size == 0 {
                    return Err(MooncakeError::invalid_argument("object_size must be nonzero"));
                }
                let v = vl.allocate_version();
                (v, shard_sizes_for(size, self.shard_size))
            }
        };

        let mut handles = Vec::with_capacity(shard_sizes.len());
        // Seed with segments already used by sibling replicas at this
        // version so a grown replica prefers segments the source
        // replica doesn't occupy, not just segments within itself.
        let mut used_segments: HashSet<SegmentId> = vl
            .versions
            .get(&version)
            .map(|info| {
                info.replicas
                    .values()
                    .flat_map(|r| r.handles.iter().map(BufHandle::segment_id))
                    .collect()
            })
            .unwrap_or_default();
        for &size in &shard_sizes {
            match self.allocate_one_shard(size, &used_segments, strategy) {
                Ok(handle) => {
                    used_segments.insert(handle.segment_id());
                    handles.push(handle);
                }
                Err(e) => {
                    for handle in &handles {
                        handle.deallocate();
                    }
                    return Err(e);
                }
            }
        }

        let info = vl.versions.entry(version).or_insert_with(|| VersionInfo::new(shard_sizes));
        let replica_id = info.allocate_replica_id();
        info.replicas.insert(replica_id, ReplicaInfo::new(replica_id, handles));
        Ok((version, replica_id))
    }

    /// Assembles a replica for reading, handle by handle, from the
    /// latest version whose `flushed_version` is `>= min_version` (§4.3
    /// `get_one_replica`). Each shard position is served by whichever
    /// replica the strategy picks among those with a `Complete` handle
    /// there -- a "virtual" replica may draw different shards from
    /// different physical replicas.
    pub fn get_one_replica(
        &self,
        key: &str,
        min_version: Option<Version>,
        strategy: &dyn AllocationStrategy,
    ) -> MooncakeResult<(Version, Vec<BufHandle>)> {
        let version_list = self.existing_version_list(key)?;
        let vl = version_list.read().expect("version list lock poisoned");
        let flushed = vl
            .flushed_version
            .ok_or_else(|| MooncakeError::InvalidVersion { key: key.to_string(), version: None })?;
        if let Some(min_v) = min_version {
            if flushed < min_v {
                return Err(MooncakeError::InvalidVersion { key: key.to_string(), version: Some(min_v.into()) });
            }
        }
        let info = vl
            .versions
            .get(&flushed)
            .ok_or_else(|| MooncakeError::InvalidVersion { key: key.to_string(), version: Some(flushed.into()) })?;

        let mut assembled = Vec::with_capacity(info.shard_count());
        for shard_index in 0..info.shard_count() {
            let candidates: Vec<HandleCandidate<'_>> = info
                .live_replicas()
                .filter_map(|r| {
                    r.handles.get(shard_index).and_then(|h| {
                        (h.status() == ShardStatus::Complete)
                            .then_some(HandleCandidate { replica_id: r.replica_id, handle: h })
                    })
                })
                .collect();
            let chosen = strategy
                .select_handle(&candidates, &HashSet::new())
                .map_err(|_| MooncakeError::NoAvailableHandle(shard_index))?;
            assembled.push(chosen.clone());
        }
        Ok((flushed, assembled))
    }

    /// Re-allocates a fresh handle (of the same size, on a different
    /// segment when possible) for every `Failed` shard in one replica,
    /// leaving the others untouched (§4.3 `reassign_replica`).
    pub fn reassign_replica(
        &self,
        key: &str,
        version: Version,
        replica_id: ReplicaId,
        strategy: &dyn AllocationStrategy,
    ) -> MooncakeResult<Vec<BufHandle>> {
        let version_list = self.existing_version_list(key)?;
        let mut vl = version_list.write().expect("version list lock poisoned");
        let info = vl
            .versions
            .get_mut(&version)
            .ok_or_else(|| MooncakeError::InvalidVersion { key: key.to_string(), version: Some(version.into()) })?;
        let replica = info
            .replicas
            .get_mut(&replica_id)
            .ok_or_else(|| MooncakeError::InvalidReplica(key.to_string(), format!("no replica {replica_id}")))?;

        let used_segments: HashSet<SegmentId> = replica
            .handles
            .iter()
            .filter(|h| h.status() != ShardStatus::Failed)
            .map(BufHandle::segment_id)
            .collect();

        for slot in &mut replica.handles {
            if slot.status() == ShardStatus::Failed {
                let size = slot.size();
                *slot = self.allocate_one_shard(size, &used_segments, strategy)?;
            }
        }
        replica.status = if replica.handles.iter().all(|h| h.status() == ShardStatus::Complete) {
            ReplicaStatus::Complete
        } else {
            ReplicaStatus::Initialized
        };
        Ok(replica.handles.clone())
    }

    /// Removes one replica at `version` (or `flushed_version` if
    /// unset): any replica not already `Removed`. Idempotent -- once
    /// none remain, returns `Ok(None)` rather than an error (§8
    /// invariant 6).
    pub fn remove_one_replica(
        &self,
        key: &str,
        version: Option<Version>,
    ) -> MooncakeResult<Option<(Version, ReplicaId)>> {
        let version_list = self.existing_version_list(key)?;
        let mut vl = version_list.write().expect("version list lock poisoned");
        let target = match version.or(vl.flushed_version) {
            Some(v) => v,
            None => return Ok(None),
        };
        let Some(info) = vl.versions.get_mut(&target) else {
            return Ok(None);
        };
        let victim = info
            .replicas
            .values()
            .filter(|r| r.status != ReplicaStatus::Removed)
            .map(|r| r.replica_id)
            .min();
        let Some(replica_id) = victim else {
            return Ok(None);
        };
        let replica = info.replicas.get_mut(&replica_id).expect("replica looked up above");
        replica.status = ReplicaStatus::Removed;
        replica.handles.clear();
        info.complete_replicas.remove(&replica_id);
        Ok(Some((target, replica_id)))
    }

    /// For each handle in `old_handles`, finds the replica shard slot it
    /// occupies (by identity, via [`BufHandle::same_allocation`]) and
    /// splices in a freshly allocated same-size handle, preferring a
    /// different segment (§4.3 `recovery`). Returns the number of shards
    /// actually re-homed.
    pub fn recovery(&self, old_handles: &[BufHandle], strategy: &dyn AllocationStrategy) -> MooncakeResult<usize> {
        let version_lists: Vec<Arc<RwLock<VersionList>>> =
            self.objects.read().expect("object table lock poisoned").values().cloned().collect();

        let mut recovered = 0usize;
        for old in old_handles {
            for vl_arc in &version_lists {
                let mut vl = vl_arc.write().expect("version list lock poisoned");
                if self.try_recover_one(&mut vl, old, strategy)? {
                    recovered += 1;
                    break;
                }
            }
        }
        Ok(recovered)
    }

    fn try_recover_one(
        &self,
        vl: &mut VersionList,
        old: &BufHandle,
        strategy: &dyn AllocationStrategy,
    ) -> MooncakeResult<bool> {
        for info in vl.versions.values_mut() {
            for replica in info.replicas.values_mut() {
                if replica.status == ReplicaStatus::Removed {
                    continue;
                }
                if let Some(slot_idx) = replica.handles.iter().position(|h| h.same_allocation(old)) {
                    let size = replica.handles[slot_idx].size();
                    let avoid: HashSet<SegmentId> = replica
                        .handles
                        .iter()
                        .enumerate()
                        .filter(|&(i, _)| i != slot_idx)
                        .map(|(_, h)| h.segment_id())
                        .collect();
                    let fresh = self.allocate_one_shard(size, &avoid, strategy)?;
                    replica.handles[slot_idx] = fresh;
                    replica.status = if replica.handles.iter().all(|h| h.status() == ShardStatus::Complete) {
                        ReplicaStatus::Complete
                    } else {
                        ReplicaStatus::Partial
                    };
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Scans every live replica shard; any not `Complete` or `Init` is
    /// fed to [`Self::recovery`]. Then promotes any replica whose shards
    /// are now all `Complete`, advancing `flushed_version` as needed
    /// (§4.3 `check_all`).
    pub fn check_all(&self, strategy: &dyn AllocationStrategy) -> MooncakeResult<usize> {
        let version_lists: Vec<Arc<RwLock<VersionList>>> =
            self.objects.read().expect("object table lock poisoned").values().cloned().collect();

        let mut broken = Vec::new();
        for vl_arc in &version_lists {
            let vl = vl_arc.read().expect("version list lock poisoned");
            for info in vl.versions.values() {
                for replica in info.live_replicas() {
                    for handle in &replica.handles {
                        if !matches!(handle.status(), ShardStatus::Complete | ShardStatus::Init) {
                            broken.push(handle.clone());
                        }
                    }
                }
            }
        }

        let recovered = if broken.is_empty() { 0 } else { self.recovery(&broken, strategy)? };

        for vl_arc in &version_lists {
            let mut vl = vl_arc.write().expect("version list lock poisoned");
            let mut newly_flushed = None;
            for (&version, info) in &mut vl.versions {
                for (&replica_id, replica) in &mut info.replicas {
                    if replica.status == ReplicaStatus::Removed {
                        continue;
                    }
                    if replica.handles.iter().all(|h| h.status() == ShardStatus::Complete) {
                        replica.status = ReplicaStatus::Complete;
                        info.complete_replicas.insert(replica_id);
                        if newly_flushed.map_or(true, |f| version > f) {
                            newly_flushed = Some(version);
                        }
                    }
                }
            }
            if let Some(v) = newly_flushed {
                vl.advance_flushed(v);
            }
        }
        Ok(recovered)
    }

    /// Explicit status transition for one replica (§4.3 `update_status`).
    pub fn update_status(
        &self,
        key: &str,
        status: ReplicaStatus,
        replica_id: ReplicaId,
        version: Version,
    ) -> MooncakeResult<()> {
        let version_list = self.existing_version_list(key)?;
        let mut vl = version_list.write().expect("version list lock poisoned");
        let mut flush_target = None;
        {
            let info = vl
                .versions
                .get_mut(&version)
                .ok_or_else(|| MooncakeError::InvalidVersion { key: key.to_string(), version: Some(version.into()) })?;
            let replica = info
                .replicas
                .get_mut(&replica_id)
                .ok_or_else(|| MooncakeError::InvalidReplica(key.to_string(), format!("no replica {replica_id}")))?;
            replica.status = status;
            if status == ReplicaStatus::Complete {
                info.complete_replicas.insert(replica_id);
                flush_target = Some(version);
            } else {
                info.complete_replicas.remove(&replica_id);
            }
        }
        if let Some(v) = flush_target {
            vl.advance_flushed(v);
        }
        Ok(())
    }

    /// Removes replicas in status other than `Complete`/`Partial`
    /// outright, then trims excess `Partial` replicas (lowest id first)
    /// until at most `max_replicas` complete-or-partial replicas remain
    /// (§4.3 `clean_incomplete_replica`; see DESIGN.md for how the
    /// ambiguous "prefer keeping repairable partials" wording was
    /// resolved).
    pub fn clean_incomplete_replica(&self, key: &str, version: Version, max_replicas: usize) -> MooncakeResult<usize> {
        let version_list = self.existing_version_list(key)?;
        let mut vl = version_list.write().expect("version list lock poisoned");
        let info = vl
            .versions
            .get_mut(&version)
            .ok_or_else(|| MooncakeError::InvalidVersion { key: key.to_string(), version: Some(version.into()) })?;

        let mut removed = 0usize;
        let stale: Vec<ReplicaId> = info
            .replicas
            .iter()
            .filter(|(_, r)| !matches!(r.status, ReplicaStatus::Complete | ReplicaStatus::Partial | ReplicaStatus::Removed))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(r) = info.replicas.get_mut(&id) {
                r.status = ReplicaStatus::Removed;
                r.handles.clear();
                info.complete_replicas.remove(&id);
                removed += 1;
            }
        }

        let mut partials: Vec<ReplicaId> = info
            .replicas
            .iter()
            .filter(|(_, r)| r.status == ReplicaStatus::Partial)
            .map(|(id, _)| *id)
            .collect();
        partials.sort_unstable();
        let live_count = info.replicas.values().filter(|r| r.status != ReplicaStatus::Removed).count();
        let mut over = live_count.saturating_sub(max_replicas);
        for id in partials {
            if over == 0 {
                break;
            }
            if let Some(r) = info.replicas.get_mut(&id) {
                r.status = ReplicaStatus::Removed;
                r.handles.clear();
                info.complete_replicas.remove(&id);
                removed += 1;
                over -= 1;
            }
        }
        Ok(removed)
    }

    /// `(flushed_version, object_size, live replica count)` for `key`,
    /// used by [`crate::ObjectStore::replicate`] to decide how many
    /// replicas to add or remove.
    pub fn version_summary(&self, key: &str) -> MooncakeResult<(Version, u64, usize)> {
        let version_list = self.existing_version_list(key)?;
        let vl = version_list.read().expect("version list lock poisoned");
        let flushed = vl
            .flushed_version
            .ok_or_else(|| MooncakeError::InvalidVersion { key: key.to_string(), version: None })?;
        let info = vl
            .versions
            .get(&flushed)
            .ok_or_else(|| MooncakeError::InvalidVersion { key: key.to_string(), version: Some(flushed.into()) })?;
        let live = info
            .replicas
            .values()
            .filter(|r| matches!(r.status, ReplicaStatus::Complete | ReplicaStatus::Partial))
            .count();
        Ok((flushed, info.object_size(), live))
    }

    /// The live handles of one replica, for the object store's write
    /// path. Returns a clone of each handle (shared, reference-counted
    /// with the allocator's copy).
    pub fn replica_handles(&self, key: &str, version: Version, replica_id: ReplicaId) -> MooncakeResult<Vec<BufHandle>> {
        let version_list = self.existing_version_list(key)?;
        let vl = version_list.read().expect("version list lock poisoned");
        let info = vl
            .versions
            .get(&version)
            .ok_or_else(|| MooncakeError::InvalidVersion { key: key.to_string(), version: Some(version.into()) })?;
        let replica = info
            .replicas
            .get(&replica_id)
            .ok_or_else(|| MooncakeError::InvalidReplica(key.to_string(), format!("no replica {replica_id}")))?;
        Ok(replica.handles.clone())
    }

    /// Every `(key, version, replica_id)` currently `Partial` (§4.4
    /// `check_all`'s "for every Partial replica" step).
    pub fn partial_replicas(&self) -> Vec<(String, Version, ReplicaId)> {
        let objects = self.objects.read().expect("object table lock poisoned");
        let mut out = Vec::new();
        for (key, vl_arc) in objects.iter() {
            let vl = vl_arc.read().expect("version list lock poisoned");
            for (&version, info) in &vl.versions {
                for replica in info.replicas.values() {
                    if replica.status == ReplicaStatus::Partial {
                        out.push((key.clone(), version, replica.replica_id));
                    }
                }
            }
        }
        out
    }

    /// Any one replica id known `Complete` at `(key, version)`, to use
    /// as a copy source for repair or for `replicate`'s growth path.
    pub fn any_complete_replica(&self, key: &str, version: Version) -> MooncakeResult<ReplicaId> {
        let version_list = self.existing_version_list(key)?;
        let vl = version_list.read().expect("version list lock poisoned");
        let info = vl
            .versions
            .get(&version)
            .ok_or_else(|| MooncakeError::InvalidVersion { key: key.to_string(), version: Some(version.into()) })?;
        info.complete_replicas
            .iter()
            .next()
            .copied()
            .ok_or_else(|| MooncakeError::NoAvailableHandle(0))
    }

    /// Removes every replica at `version` outright, freeing their
    /// shards. Used by `put` when no replica ever reached `Complete`
    /// (§4.4 "If no replica reached Complete, remove the version and
    /// fail WriteFail").
    pub fn drop_version(&self, key: &str, version: Version) -> MooncakeResult<()> {
        let version_list = self.existing_version_list(key)?;
        let mut vl = version_list.write().expect("version list lock poisoned");
        vl.versions.remove(&version);
        Ok(())
    }
}
