//! Shared bookkeeping used by every transport implementation: the local
//! segment descriptor, batch table, and request-to-task/slice slicing
//! (§4.5.3 steps 1-2, 5). Device selection and per-context grouping stay
//! transport-specific and live in `rdma`/`tcp`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use mooncake_common::{
    BatchId, Config, DeviceDescriptor, MooncakeError, MooncakeResult, PriorityMatrix,
    SegmentDescriptor, SegmentId, TransferRequest,
};
use mooncake_metadata::{MetadataClient, SegmentDescCache, SegmentIdCache};

use crate::model::{Batch, Slice, Task, TransferStatus};

pub struct TransportRegistry {
    metadata: Arc<dyn MetadataClient>,
    id_cache: SegmentIdCache,
    desc_cache: SegmentDescCache,
    reverse_names: RwLock<HashMap<SegmentId, String>>,
    local_segment: RwLock<SegmentDescriptor>,
    config: Config,
    batches: Mutex<HashMap<BatchId, Arc<Batch>>>,
    next_batch_id: AtomicU64,
}

impl TransportRegistry {
    pub fn new(
        metadata: Arc<dyn MetadataClient>,
        local_server_name: &str,
        protocol: &str,
        config: Config,
    ) -> Self {
        Self {
            metadata,
            id_cache: SegmentIdCache::new(),
            desc_cache: SegmentDescCache::new(),
            reverse_names: RwLock::new(HashMap::new()),
            local_segment: RwLock::new(SegmentDescriptor::new(local_server_name, protocol)),
            config,
            batches: Mutex::new(HashMap::new()),
            next_batch_id: AtomicU64::new(1),
        }
    }

    pub fn metadata(&self) -> &dyn MetadataClient {
        self.metadata.as_ref()
    }

    pub fn desc_cache(&self) -> &SegmentDescCache {
        &self.desc_cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_segment_name(&self) -> String {
        self.local_segment
            .read()
            .expect("local segment lock poisoned")
            .name
            .clone()
    }

    /// Renames the local segment. Transports that only learn their final
    /// advertised name at `install` time (e.g. once a data port is bound)
    /// call this before the first `publish_local_segment`.
    pub fn set_local_name(&self, name: &str) {
        self.local_segment
            .write()
            .expect("local segment lock poisoned")
            .name = name.to_string();
    }

    pub fn with_local_segment<R>(&self, f: impl FnOnce(&SegmentDescriptor) -> R) -> R {
        f(&self.local_segment.read().expect("local segment lock poisoned"))
    }

    pub fn add_device(&self, device: DeviceDescriptor) {
        self.local_segment
            .write()
            .expect("local segment lock poisoned")
            .devices
            .push(device);
    }

    pub fn set_priority_matrix(&self, matrix: PriorityMatrix) {
        self.local_segment
            .write()
            .expect("local segment lock poisoned")
            .priority_matrix = matrix;
    }

    /// Publishes the current local segment descriptor to the metadata
    /// store (§4.5.1 steps 3 and 5).
    pub fn publish_local_segment(&self) -> MooncakeResult<()> {
        let seg = self.local_segment.read().expect("local segment lock poisoned");
        self.metadata.put_segment(&seg.name, &seg)
    }

    /// §4.5.2: registers a buffer descriptor, rejecting overlap with an
    /// already-registered range.
    pub fn register_buffer(
        &self,
        addr: u64,
        length: u64,
        location: &str,
        rkey: Vec<u32>,
        lkey: Vec<u32>,
        remote_accessible: bool,
        update_metadata: bool,
    ) -> MooncakeResult<()> {
        {
            let mut seg = self.local_segment.write().expect("local segment lock poisoned");
            if let Some(existing) = seg.overlaps_any(addr, length) {
                return Err(MooncakeError::AddressOverlapped {
                    new_addr: addr,
                    new_end: addr + length,
                    existing: existing.name.clone(),
                });
            }
            seg.buffers.push(mooncake_common::BufferDescriptor {
                name: location.to_string(),
                addr,
                length,
                rkey,
                lkey,
            });
        }
        if update_metadata && remote_accessible {
            self.publish_local_segment()?;
        }
        Ok(())
    }

    pub fn unregister_buffer(&self, addr: u64, update_metadata: bool) -> MooncakeResult<()> {
        {
            let mut seg = self.local_segment.write().expect("local segment lock poisoned");
            seg.buffers.retain(|b| b.addr != addr);
        }
        if update_metadata {
            self.publish_local_segment()?;
        }
        Ok(())
    }

    /// §4.1 `get_segment_id` via the lazy id cache, validating the
    /// segment actually exists in the metadata store first.
    pub fn open_segment(&self, name: &str) -> MooncakeResult<SegmentId> {
        self.desc_cache.get(self.metadata.as_ref(), name)?;
        let id = self.id_cache.get_or_assign(name);
        self.reverse_names
            .write()
            .expect("reverse segment name lock poisoned")
            .insert(id, name.to_string());
        Ok(id)
    }

    pub fn close_segment(&self, _segment_id: SegmentId) -> MooncakeResult<()> {
        // No per-segment local resource is held beyond the shared
        // descriptor cache, which other open segments may still need.
        Ok(())
    }

    /// Reverses `open_segment`: the name a [`SegmentId`] was assigned to.
    pub fn segment_name(&self, id: SegmentId) -> Option<String> {
        self.reverse_names
            .read()
            .expect("reverse segment name lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn allocate_batch(&self, size: usize) -> MooncakeResult<BatchId> {
        let id = BatchId::new(self.next_batch_id.fetch_add(1, Ordering::Relaxed));
        self.batches
            .lock()
            .expect("batch table lock poisoned")
            .insert(id, Arc::new(Batch::new(id, size)));
        Ok(id)
    }

    pub fn batch(&self, id: BatchId) -> MooncakeResult<Arc<Batch>> {
        self.batches
            .lock()
            .expect("batch table lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| MooncakeError::invalid_argument(format!("unknown batch {id}")))
    }

    pub fn free_batch(&self, id: BatchId) -> MooncakeResult<()> {
        let batch = self.batch(id)?;
        batch.check_free()?;
        self.batches.lock().expect("batch table lock poisoned").remove(&id);
        Ok(())
    }

    pub fn get_transfer_status(&self, id: BatchId, task_idx: usize) -> MooncakeResult<TransferStatus> {
        let batch = self.batch(id)?;
        let task = batch
            .task(task_idx)
            .ok_or_else(|| MooncakeError::invalid_argument(format!("unknown task {task_idx} in batch {id}")))?;
        Ok(task.status())
    }

    /// §4.5.3 steps 1-2 and 5: splits each request into `slice_size`
    /// slices and validates the source address against a registered
    /// local buffer. Device selection and per-context grouping are left
    /// to the caller.
    pub fn build_tasks(&self, requests: &[TransferRequest]) -> MooncakeResult<Vec<Arc<Task>>> {
        let slice_size = self.config.slice_size;
        let retry_cap = self.config.retry_cnt;
        let seg = self.local_segment.read().expect("local segment lock poisoned");

        let mut tasks = Vec::with_capacity(requests.len());
        for req in requests {
            if seg.buffer_for_range(req.source, 1).is_none() {
                return Err(MooncakeError::AddressNotRegistered {
                    addr: req.source,
                    len: req.length,
                });
            }

            let mut slices = Vec::new();
            let mut remaining = req.length;
            let mut src_off = 0u64;
            let mut dst_off = 0u64;
            while remaining > 0 {
                let len = remaining.min(slice_size);
                slices.push(Slice::new(
                    req.source + src_off,
                    len,
                    req.opcode,
                    SegmentId::new(req.target_id as u64),
                    req.target_offset + dst_off,
                    retry_cap,
                ));
                remaining -= len;
                src_off += len;
                dst_off += len;
            }

            tasks.push(Arc::new(Task::new(
                req.opcode,
                req.source,
                SegmentId::new(req.target_id as u64),
                req.target_offset,
                req.length,
                slices,
            )));
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooncake_common::Opcode;
    use mooncake_metadata::LocalMetadataStore;

    fn registry() -> TransportRegistry {
        let reg = TransportRegistry::new(
            Arc::new(LocalMetadataStore::new()),
            "node-a",
            "tcp",
            Config::default(),
        );
        reg.register_buffer(1000, 4096, "cpu:0", vec![1], vec![2], false, false)
            .unwrap();
        reg
    }

    #[test]
    fn build_tasks_rejects_unregistered_source() {
        let reg = registry();
        let req = TransferRequest {
            opcode: Opcode::Write,
            source: 9_999_999,
            target_id: 1,
            target_offset: 0,
            length: 64,
        };
        let err = reg.build_tasks(&[req]).unwrap_err();
        assert!(matches!(err, MooncakeError::AddressNotRegistered { .. }));
    }

    #[test]
    fn build_tasks_splits_by_slice_size() {
        let reg = registry();
        let mut cfg = Config::default();
        cfg.slice_size = 100;
        let reg = TransportRegistry::new(
            Arc::new(LocalMetadataStore::new()),
            "node-a",
            "tcp",
            cfg,
        );
        reg.register_buffer(1000, 4096, "cpu:0", vec![1], vec![2], false, false)
            .unwrap();
        let req = TransferRequest {
            opcode: Opcode::Write,
            source: 1000,
            target_id: 1,
            target_offset: 0,
            length: 250,
        };
        let tasks = reg.build_tasks(&[req]).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].slice_count(), 3);
    }

    #[test]
    fn register_buffer_rejects_overlap() {
        let reg = registry();
        let err = reg
            .register_buffer(1500, 100, "cpu:0", vec![1], vec![2], false, false)
            .unwrap_err();
        assert!(matches!(err, MooncakeError::AddressOverlapped { .. }));
    }

    #[test]
    fn allocate_and_free_batch() {
        let reg = registry();
        let batch_id = reg.allocate_batch(4).unwrap();
        assert!(reg.free_batch(batch_id).is_ok());
        assert!(reg.batch(batch_id).is_err());
    }

    #[test]
    fn open_segment_fails_for_unknown_name() {
        let reg = registry();
        assert!(reg.open_segment("ghost").is_err());
    }
}
