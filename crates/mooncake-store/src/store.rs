//! [`DistributedObjectStore`]: the facade exposed to callers (§4.4) --
//! `put`/`get`/`remove`/`replicate`/`check_all` plus the `batch_put`/
//! `batch_get` convenience wrappers, all translating to per-shard
//! transfers submitted through one [`TransferEngine`].

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mooncake_allocator::{BufHandle, ShardStatus};
use mooncake_common::{BatchId, BufferIndex, MooncakeError, MooncakeResult, Opcode, SegmentId, TransferRequest, Version};
use mooncake_transfer_engine::{TransferEngine, TransferStatus};

use crate::allocator::{ReplicaAllocator, DEFAULT_SHARD_SIZE};
use crate::replica::{ReplicaChange, ReplicaDiff, ReplicaStatus, ReplicateConfig};
use crate::requests::{generate_read_requests, generate_write_requests, reconcile_shard_statuses, IoVec, RequestOutcome};
use crate::strategy::{AllocationStrategy, RandomStrategy};

/// Default cap on submission/repair retries before giving up (§4.4
/// "e.g. 10").
const DEFAULT_MAX_TRYNUM: usize = 10;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct ObjectStoreConfig {
    pub max_trynum: usize,
    pub shard_size: u64,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self { max_trynum: DEFAULT_MAX_TRYNUM, shard_size: DEFAULT_SHARD_SIZE }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PutConfig {
    pub replica_num: usize,
}

impl Default for PutConfig {
    fn default() -> Self {
        Self { replica_num: 1 }
    }
}

pub struct DistributedObjectStore {
    engine: Arc<TransferEngine>,
    allocator: ReplicaAllocator,
    strategy: Box<dyn AllocationStrategy>,
    config: ObjectStoreConfig,
}

impl DistributedObjectStore {
    pub fn new(engine: Arc<TransferEngine>, config: ObjectStoreConfig) -> Self {
        Self::with_strategy(engine, config, Box::new(RandomStrategy::from_entropy()))
    }

    pub fn with_strategy(
        engine: Arc<TransferEngine>,
        config: ObjectStoreConfig,
        strategy: Box<dyn AllocationStrategy>,
    ) -> Self {
        Self {
            engine,
            allocator: ReplicaAllocator::new(config.shard_size),
            strategy,
            config,
        }
    }

    /// Registers memory already reachable through `self.engine` as one
    /// more buffer allocator pool (§4.3 `register_buffer`). `segment_id`
    /// must be a segment this node owns -- i.e. the same id
    /// `TransferEngine::open_segment` would resolve for its own name.
    pub fn register_buffer(&self, segment_id: SegmentId, base: u64, length: u64) -> BufferIndex {
        self.allocator.register_buffer(segment_id, base, length)
    }

    /// Takes a buffer allocator out of service and re-homes every shard
    /// it held onto other registered segments (§4.3 `unregister` +
    /// `recovery`, run back to back so unregistering a segment triggers
    /// recovery of everything it was holding).
    pub fn unregister_buffer(&self, segment_id: SegmentId, buffer_index: BufferIndex) -> MooncakeResult<usize> {
        let orphaned = self.allocator.unregister(segment_id, buffer_index)?;
        self.allocator.recovery(&orphaned, self.strategy.as_ref())
    }

    pub fn shutdown(&self) {
        self.allocator.shutdown();
    }

    // ---- write path ----------------------------------------------------

    /// §4.4 `Put`.
    pub fn put(&self, key: &str, iovecs: &[IoVec], config: PutConfig) -> MooncakeResult<Version> {
        let total: u64 = iovecs.iter().map(|v| v.len).sum();
        if total == 0 {
            return Err(MooncakeError::invalid_argument("put: total size must be nonzero"));
        }
        if config.replica_num == 0 {
            return Err(MooncakeError::invalid_argument("put: replica_num must be nonzero"));
        }

        let mut version = None;
        let mut any_complete = false;

        for _ in 0..config.replica_num {
            let (v, replica_id) = self.allocator.add_one_replica(
                key,
                version,
                if version.is_none() { Some(total) } else { None },
                self.strategy.as_ref(),
            )?;
            version = Some(v);

            let status = self.write_replica_with_retries(key, v, replica_id, iovecs, self.config.max_trynum)?;
            self.allocator.update_status(key, status, replica_id, v)?;
            any_complete |= status == ReplicaStatus::Complete;
        }

        let version = version.expect("loop runs at least once");
        if !any_complete {
            self.allocator.drop_version(key, version)?;
            return Err(MooncakeError::WriteFail(key.to_string()));
        }
        Ok(version)
    }

    fn write_replica_with_retries(
        &self,
        key: &str,
        version: Version,
        replica_id: mooncake_common::ReplicaId,
        iovecs: &[IoVec],
        max_trynum: usize,
    ) -> MooncakeResult<ReplicaStatus> {
        let mut last_status = ReplicaStatus::Initialized;
        for attempt in 0..max_trynum {
            let shards = self.allocator.replica_handles(key, version, replica_id)?;
            let shard_refs: Vec<&BufHandle> = shards.iter().collect();
            let requests = generate_write_requests(iovecs, &shard_refs);

            let outcomes = self.submit_and_await(&requests)?;
            last_status = reconcile_shard_statuses(&requests, &outcomes, &shard_refs);
            if last_status == ReplicaStatus::Complete {
                return Ok(last_status);
            }
            if attempt + 1 < max_trynum {
                self.allocator.reassign_replica(key, version, replica_id, self.strategy.as_ref())?;
            }
        }
        Ok(last_status)
    }

    /// Thin per-key wrapper around [`Self::put`] (§9 supplement).
    /// Continues past individual failures so one bad key doesn't block
    /// the rest of the batch.
    pub fn batch_put(&self, items: &[(String, Vec<IoVec>)], config: PutConfig) -> Vec<MooncakeResult<Version>> {
        items.iter().map(|(key, iovecs)| self.put(key, iovecs, config)).collect()
    }

    // ---- read path -------------------------------------------------

    /// §4.4 `Get`.
    pub fn get(
        &self,
        key: &str,
        iovecs: &[IoVec],
        min_version: Option<Version>,
        offset: u64,
    ) -> MooncakeResult<Version> {
        let mut last_err = None;
        for _ in 0..self.config.max_trynum {
            let (version, handles) = self.allocator.get_one_replica(key, min_version, self.strategy.as_ref())?;
            let shard_refs: Vec<&BufHandle> = handles.iter().collect();
            let requests = match generate_read_requests(iovecs, &shard_refs, offset) {
                Ok(r) => r,
                Err(e) => return Err(e),
            };
            if requests.is_empty() {
                return Ok(version);
            }

            match self.submit_and_await(&requests) {
                Ok(outcomes) => {
                    if outcomes.iter().all(|o| *o == RequestOutcome::Success) {
                        return Ok(version);
                    }
                    self.mark_failed_shards(&requests, &outcomes, &shard_refs);
                    last_err = Some(MooncakeError::InvalidRead(format!("read of {key} at version {version} failed")));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| MooncakeError::InvalidKey(key.to_string())))
    }

    fn mark_failed_shards(&self, requests: &[TransferRequest], outcomes: &[RequestOutcome], shards: &[&BufHandle]) {
        for (request, outcome) in requests.iter().zip(outcomes) {
            if *outcome == RequestOutcome::Failed {
                if let Some(shard) = shards.iter().find(|s| {
                    request.target_offset >= s.addr() && request.target_offset < s.addr() + s.size()
                }) {
                    shard.set_status(ShardStatus::Failed);
                }
            }
        }
    }

    /// Thin per-key wrapper around [`Self::get`] (§9 supplement).
    pub fn batch_get(
        &self,
        items: &[(String, Vec<IoVec>, Option<Version>, u64)],
    ) -> Vec<MooncakeResult<Version>> {
        items
            .iter()
            .map(|(key, iovecs, min_version, offset)| self.get(key, iovecs, *min_version, *offset))
            .collect()
    }

    // ---- lifecycle ---------------------------------------------------

    /// §4.4 `Remove`: loops `remove_one_replica` until the version has
    /// none left.
    pub fn remove(&self, key: &str, version: Option<Version>) -> MooncakeResult<Version> {
        let mut target = version;
        loop {
            match self.allocator.remove_one_replica(key, target)? {
                Some((v, _replica_id)) => target = Some(v),
                None => break,
            }
        }
        target.ok_or_else(|| MooncakeError::InvalidKey(key.to_string()))
    }

    /// §4.4 `Replicate`.
    pub fn replicate(&self, key: &str, new_config: ReplicateConfig) -> MooncakeResult<(Version, ReplicaDiff)> {
        let (version, _object_size, live) = self.allocator.version_summary(key)?;

        if new_config.replica_num > live {
            let to_add = new_config.replica_num - live;
            let source_id = self.allocator.any_complete_replica(key, version)?;
            let source_shards = self.allocator.replica_handles(key, version, source_id)?;

            let mut added = Vec::with_capacity(to_add);
            for _ in 0..to_add {
                let (_, replica_id) = self.allocator.add_one_replica(key, Some(version), None, self.strategy.as_ref())?;
                let dest_shards = self.allocator.replica_handles(key, version, replica_id)?;

                let mut all_ok = true;
                for (source, dest) in source_shards.iter().zip(dest_shards.iter()) {
                    if !self.copy_shard_content(source, dest)? {
                        all_ok = false;
                    }
                }
                let status = if all_ok { ReplicaStatus::Complete } else { ReplicaStatus::Partial };
                self.allocator.update_status(key, status, replica_id, version)?;
                added.push(replica_id);
            }

            self.allocator.clean_incomplete_replica(key, version, new_config.replica_num)?;
            return Ok((version, ReplicaDiff { change: ReplicaChange::Added, replica_ids: added }));
        }

        if new_config.replica_num < live {
            let to_remove = live - new_config.replica_num;
            let mut removed = Vec::with_capacity(to_remove);
            for _ in 0..to_remove {
                if let Some((_, replica_id)) = self.allocator.remove_one_replica(key, Some(version))? {
                    removed.push(replica_id);
                }
            }
            return Ok((version, ReplicaDiff { change: ReplicaChange::Removed, replica_ids: removed }));
        }

        Ok((version, ReplicaDiff::default()))
    }

    /// §4.4 `check_all`: drives the allocator's storage-level recovery
    /// sweep, then reconstructs content for any shard recovery left
    /// empty by copying from a same-version `Complete` replica.
    pub fn check_all(&self) -> MooncakeResult<()> {
        self.allocator.check_all(self.strategy.as_ref())?;

        for (key, version, replica_id) in self.allocator.partial_replicas() {
            let Ok(source_id) = self.allocator.any_complete_replica(&key, version) else {
                continue;
            };
            if source_id == replica_id {
                continue;
            }
            let source_shards = self.allocator.replica_handles(&key, version, source_id)?;
            let dest_shards = self.allocator.replica_handles(&key, version, replica_id)?;

            let needs_content: Vec<usize> = dest_shards
                .iter()
                .enumerate()
                .filter(|(_, h)| h.status() != ShardStatus::Complete)
                .map(|(i, _)| i)
                .collect();

            for &idx in &needs_content {
                for attempt in 0..self.config.max_trynum {
                    if self.copy_shard_content(&source_shards[idx], &dest_shards[idx])? {
                        break;
                    }
                    if attempt + 1 == self.config.max_trynum {
                        tracing::warn!(key, shard = idx, "check_all: exhausted retries reconstructing shard");
                    }
                }
            }

            let status = if dest_shards.iter().all(|h| h.status() == ShardStatus::Complete) {
                ReplicaStatus::Complete
            } else {
                ReplicaStatus::Partial
            };
            self.allocator.update_status(&key, status, replica_id, version)?;
        }
        Ok(())
    }

    // ---- transport plumbing -----------------------------------------

    /// Stages `source`'s content through a local scratch buffer and
    /// writes it into `dest` (§4.4 `Replicate`'s "Added" path and
    /// `check_all`'s reconstruction step). There is no remote-to-remote
    /// transfer primitive, so cross-replica copies always pass through
    /// this node.
    fn copy_shard_content(&self, source: &BufHandle, dest: &BufHandle) -> MooncakeResult<bool> {
        let len = source.size();
        let mut staging = vec![0u8; len as usize];
        let staging_addr = staging.as_mut_ptr() as u64;

        self.engine.register_local_memory(staging_addr, len, "cpu:0", true, false)?;
        let read_ok = self.submit_single(TransferRequest {
            opcode: Opcode::Read,
            source: staging_addr,
            target_id: u64::from(source.segment_id()) as i32,
            target_offset: source.addr(),
            length: len,
        })?;
        let write_ok = if read_ok {
            self.submit_single(TransferRequest {
                opcode: Opcode::Write,
                source: staging_addr,
                target_id: u64::from(dest.segment_id()) as i32,
                target_offset: dest.addr(),
                length: len,
            })?
        } else {
            false
        };
        self.engine.unregister_local_memory(staging_addr, false)?;

        dest.set_status(if write_ok { ShardStatus::Complete } else { ShardStatus::Failed });
        Ok(write_ok)
    }

    fn submit_single(&self, request: TransferRequest) -> MooncakeResult<bool> {
        let outcomes = self.submit_and_await(std::slice::from_ref(&request))?;
        Ok(outcomes.first() == Some(&RequestOutcome::Success))
    }

    fn submit_and_await(&self, requests: &[TransferRequest]) -> MooncakeResult<Vec<RequestOutcome>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let batch = self.engine.allocate_batch(requests.len())?;
        let result = self.await_batch(batch, requests);
        self.engine.free_batch(batch)?;
        result
    }

    fn await_batch(&self, batch: BatchId, requests: &[TransferRequest]) -> MooncakeResult<Vec<RequestOutcome>> {
        self.engine.submit_transfer(batch, requests.to_vec())?;

        let mut outcomes = vec![None; requests.len()];
        loop {
            let mut pending = false;
            for (idx, slot) in outcomes.iter_mut().enumerate() {
                if slot.is_some() {
                    continue;
                }
                match self.engine.get_transfer_status(batch, idx)? {
                    TransferStatus::Completed => *slot = Some(RequestOutcome::Success),
                    TransferStatus::Failed => *slot = Some(RequestOutcome::Failed),
                    TransferStatus::Waiting => pending = true,
                }
            }
            if !pending {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(outcomes.into_iter().map(|o| o.expect("every slot resolved before loop exits")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooncake_metadata::{LocalMetadataStore, MetadataClient};
    use mooncake_transfer_engine::TcpTransport;
    use std::sync::atomic::{AtomicU16, Ordering};

    static NEXT_PORT: AtomicU16 = AtomicU16::new(26100);

    fn cfg() -> mooncake_common::Config {
        let mut cfg = mooncake_common::Config::default();
        cfg.handshake_port = NEXT_PORT.fetch_add(2, Ordering::Relaxed);
        cfg
    }

    /// One node acting as both local store and its own remote replica
    /// target, wired up with a loopback TCP transport (mirrors
    /// `mooncake-transfer-engine`'s own `end_to_end_write_through_engine_over_tcp`).
    struct SingleNodeFixture {
        store: DistributedObjectStore,
        _buf: Vec<u8>,
    }

    fn single_node_fixture(buf_len: usize) -> SingleNodeFixture {
        let metadata: Arc<dyn MetadataClient> = Arc::new(LocalMetadataStore::new());
        let engine_cfg = cfg();
        let port = engine_cfg.handshake_port;
        let engine = Arc::new(TransferEngine::new(Arc::clone(&metadata)));
        engine.add_transport("tcp", Arc::new(TcpTransport::new(Arc::clone(&metadata), engine_cfg)));

        let mut buf = vec![0u8; buf_len];
        engine.register_local_memory(buf.as_mut_ptr() as u64, buf_len as u64, "cpu:0", true, false).unwrap();
        engine.install("127.0.0.1").unwrap();
        thread::sleep(Duration::from_millis(50));

        let segment_name = format!("127.0.0.1:{}", port.wrapping_add(1));
        let segment_id = engine.open_segment(&segment_name).unwrap();

        let store = DistributedObjectStore::new(Arc::clone(&engine), ObjectStoreConfig::default());
        store.register_buffer(segment_id, buf.as_mut_ptr() as u64, buf_len as u64);

        SingleNodeFixture { store, _buf: buf }
    }

    #[test]
    fn put_zero_size_is_rejected() {
        let fixture = single_node_fixture(4096);
        let err = fixture.store.put("k", &[], PutConfig::default()).unwrap_err();
        assert!(matches!(err, MooncakeError::InvalidArgument(_)));
    }

    #[test]
    fn put_then_get_round_trips() {
        let fixture = single_node_fixture(1 << 16);
        let payload = vec![0xABu8; 4096];
        let iovecs = vec![IoVec { ptr: payload.as_ptr() as u64, len: payload.len() as u64 }];

        let version = fixture.store.put("object-a", &iovecs, PutConfig::default()).unwrap();

        let mut out = vec![0u8; 4096];
        let read_iovecs = vec![IoVec { ptr: out.as_mut_ptr() as u64, len: out.len() as u64 }];
        let got_version = fixture.store.get("object-a", &read_iovecs, None, 0).unwrap();

        assert_eq!(got_version, version);
        assert_eq!(out, payload);
    }

    #[test]
    fn remove_then_get_fails() {
        let fixture = single_node_fixture(1 << 16);
        let payload = vec![0x11u8; 256];
        let iovecs = vec![IoVec { ptr: payload.as_ptr() as u64, len: payload.len() as u64 }];
        let version = fixture.store.put("object-b", &iovecs, PutConfig::default()).unwrap();

        let removed = fixture.store.remove("object-b", Some(version)).unwrap();
        assert_eq!(removed, version);

        let mut out = vec![0u8; 256];
        let read_iovecs = vec![IoVec { ptr: out.as_mut_ptr() as u64, len: out.len() as u64 }];
        assert!(fixture.store.get("object-b", &read_iovecs, None, 0).is_err());
    }

    #[test]
    fn get_with_offset_reads_a_byte_window() {
        let fixture = single_node_fixture(1 << 16);
        let payload: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
        let iovecs = vec![IoVec { ptr: payload.as_ptr() as u64, len: payload.len() as u64 }];
        fixture.store.put("object-c", &iovecs, PutConfig::default()).unwrap();

        let mut out = vec![0u8; 100];
        let read_iovecs = vec![IoVec { ptr: out.as_mut_ptr() as u64, len: out.len() as u64 }];
        fixture.store.get("object-c", &read_iovecs, None, 500).unwrap();

        assert_eq!(out, payload[500..600]);
    }

    #[test]
    fn batch_put_and_batch_get_cover_every_key() {
        let fixture = single_node_fixture(1 << 16);
        let p1 = vec![1u8; 64];
        let p2 = vec![2u8; 64];
        let items = vec![
            ("k1".to_string(), vec![IoVec { ptr: p1.as_ptr() as u64, len: 64 }]),
            ("k2".to_string(), vec![IoVec { ptr: p2.as_ptr() as u64, len: 64 }]),
        ];
        let results = fixture.store.batch_put(&items, PutConfig::default());
        assert!(results.iter().all(Result::is_ok));

        let mut o1 = vec![0u8; 64];
        let mut o2 = vec![0u8; 64];
        let reads = vec![
            ("k1".to_string(), vec![IoVec { ptr: o1.as_mut_ptr() as u64, len: 64 }], None, 0u64),
            ("k2".to_string(), vec![IoVec { ptr: o2.as_mut_ptr() as u64, len: 64 }], None, 0u64),
        ];
        let got = fixture.store.batch_get(&reads);
        assert!(got.iter().all(Result::is_ok));
        assert_eq!(o1, p1);
        assert_eq!(o2, p2);
    }

    #[test]
    fn replicate_grows_and_shrinks_live_count() {
        let fixture = single_node_fixture(1 << 20);
        let payload = vec![0x5Au8; 1024];
        let iovecs = vec![IoVec { ptr: payload.as_ptr() as u64, len: 1024 }];
        fixture.store.put("object-d", &iovecs, PutConfig::default()).unwrap();

        let (_, diff) = fixture.store.replicate("object-d", ReplicateConfig { replica_num: 3 }).unwrap();
        assert_eq!(diff.change, ReplicaChange::Added);
        assert_eq!(diff.replica_ids.len(), 2);

        let (_, diff) = fixture.store.replicate("object-d", ReplicateConfig { replica_num: 1 }).unwrap();
        assert_eq!(diff.change, ReplicaChange::Removed);
        assert_eq!(diff.replica_ids.len(), 2);
    }

    #[test]
    fn check_all_is_idempotent_on_a_healthy_store() {
        let fixture = single_node_fixture(1 << 16);
        let payload = vec![0x3Cu8; 512];
        let iovecs = vec![IoVec { ptr: payload.as_ptr() as u64, len: 512 }];
        fixture.store.put("object-e", &iovecs, PutConfig::default()).unwrap();
        assert!(fixture.store.check_all().is_ok());
        assert!(fixture.store.check_all().is_ok());
    }
}
