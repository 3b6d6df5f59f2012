//! [`TransferEngine`]: the top-level facade owning the metadata client
//! and every installed transport (§3 "Ownership summary", §6 control
//! surface). A single batch may span multiple transports at once --
//! each request is routed to the transport that owns its target
//! segment's protocol, and the engine's own [`BatchId`] is an opaque
//! handle over one per-transport batch per protocol in play.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use mooncake_common::{BatchId, MooncakeError, MooncakeResult, SegmentId, TransferRequest};
use mooncake_metadata::MetadataClient;

use crate::model::TransferStatus;
use crate::transport::Transport;

struct EngineBatch {
    /// protocol -> that transport's own batch id.
    per_transport: HashMap<String, BatchId>,
    /// engine-visible task index -> (protocol, that transport's local task index).
    task_map: Vec<(String, usize)>,
}

pub struct TransferEngine {
    metadata: Arc<dyn MetadataClient>,
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
    segment_protocol: RwLock<HashMap<SegmentId, String>>,
    batches: Mutex<HashMap<BatchId, EngineBatch>>,
    next_batch_id: AtomicU64,
}

impl TransferEngine {
    pub fn new(metadata: Arc<dyn MetadataClient>) -> Self {
        Self {
            metadata,
            transports: RwLock::new(HashMap::new()),
            segment_protocol: RwLock::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
            next_batch_id: AtomicU64::new(1),
        }
    }

    /// Registers a transport under `protocol` (e.g. `"rdma"`, `"tcp"`).
    /// Call before [`Self::install`].
    pub fn add_transport(&self, protocol: &str, transport: Arc<dyn Transport>) {
        self.transports
            .write()
            .expect("transport table lock poisoned")
            .insert(protocol.to_string(), transport);
    }

    /// Runs `install` on every registered transport (§4.5.1).
    pub fn install(&self, local_server_name: &str) -> MooncakeResult<()> {
        for transport in self.transports.read().expect("transport table lock poisoned").values() {
            transport.install(local_server_name)?;
        }
        Ok(())
    }

    fn transport_for(&self, protocol: &str) -> MooncakeResult<Arc<dyn Transport>> {
        self.transports
            .read()
            .expect("transport table lock poisoned")
            .get(protocol)
            .cloned()
            .ok_or_else(|| MooncakeError::invalid_argument(format!("no transport installed for protocol {protocol}")))
    }

    /// Registers `[addr, addr+length)` as remotely-accessible memory on
    /// every installed transport (§4.5.2): a buffer is reachable over
    /// whichever transport a peer happens to open the segment with.
    pub fn register_local_memory(
        &self,
        addr: u64,
        length: u64,
        location: &str,
        remote_accessible: bool,
        update_metadata: bool,
    ) -> MooncakeResult<()> {
        for transport in self.transports.read().expect("transport table lock poisoned").values() {
            transport.register_local_memory(addr, length, location, remote_accessible, update_metadata)?;
        }
        Ok(())
    }

    pub fn unregister_local_memory(&self, addr: u64, update_metadata: bool) -> MooncakeResult<()> {
        for transport in self.transports.read().expect("transport table lock poisoned").values() {
            transport.unregister_local_memory(addr, update_metadata)?;
        }
        Ok(())
    }

    /// Resolves `name`'s protocol from the metadata store, then opens it
    /// against that protocol's transport (§4.1 `get_segment_id`).
    pub fn open_segment(&self, name: &str) -> MooncakeResult<SegmentId> {
        let desc = self.metadata.get_segment(name)?;
        let transport = self.transport_for(&desc.protocol)?;
        let id = transport.open_segment(name)?;
        self.segment_protocol
            .write()
            .expect("segment protocol table lock poisoned")
            .insert(id, desc.protocol);
        Ok(id)
    }

    pub fn close_segment(&self, segment_id: SegmentId) -> MooncakeResult<()> {
        let protocol = self
            .segment_protocol
            .read()
            .expect("segment protocol table lock poisoned")
            .get(&segment_id)
            .cloned()
            .ok_or_else(|| MooncakeError::invalid_argument("segment was never opened"))?;
        self.transport_for(&protocol)?.close_segment(segment_id)
    }

    /// Allocates `size` task slots on every installed transport, wrapped
    /// in one opaque engine-level [`BatchId`].
    pub fn allocate_batch(&self, size: usize) -> MooncakeResult<BatchId> {
        let mut per_transport = HashMap::new();
        for (protocol, transport) in self.transports.read().expect("transport table lock poisoned").iter() {
            per_transport.insert(protocol.clone(), transport.allocate_batch(size)?);
        }
        let id = BatchId::new(self.next_batch_id.fetch_add(1, Ordering::Relaxed));
        self.batches.lock().expect("engine batch table lock poisoned").insert(
            id,
            EngineBatch { per_transport, task_map: Vec::new() },
        );
        Ok(id)
    }

    /// Routes each request to the transport owning its target segment's
    /// protocol (§4.5.3), appending to that protocol's sub-batch.
    pub fn submit_transfer(&self, batch: BatchId, requests: Vec<TransferRequest>) -> MooncakeResult<()> {
        let mut by_protocol: HashMap<String, Vec<TransferRequest>> = HashMap::new();
        for req in requests {
            let segment_id = SegmentId::new(req.target_id as u64);
            let protocol = self
                .segment_protocol
                .read()
                .expect("segment protocol table lock poisoned")
                .get(&segment_id)
                .cloned()
                .ok_or_else(|| MooncakeError::invalid_argument("target segment was never opened"))?;
            by_protocol.entry(protocol).or_default().push(req);
        }

        let mut batches = self.batches.lock().expect("engine batch table lock poisoned");
        let engine_batch = batches
            .get_mut(&batch)
            .ok_or_else(|| MooncakeError::invalid_argument(format!("unknown batch {batch}")))?;

        for (protocol, reqs) in by_protocol {
            let transport_batch = *engine_batch
                .per_transport
                .get(&protocol)
                .ok_or_else(|| MooncakeError::invalid_argument(format!("no transport installed for protocol {protocol}")))?;
            let transport = self.transport_for(&protocol)?;
            let base_idx = engine_batch.task_map.iter().filter(|(p, _)| *p == protocol).count();
            transport.submit_transfer(transport_batch, reqs.clone())?;
            for offset in 0..reqs.len() {
                engine_batch.task_map.push((protocol.clone(), base_idx + offset));
            }
        }
        Ok(())
    }

    pub fn get_transfer_status(&self, batch: BatchId, task_idx: usize) -> MooncakeResult<TransferStatus> {
        let batches = self.batches.lock().expect("engine batch table lock poisoned");
        let engine_batch = batches
            .get(&batch)
            .ok_or_else(|| MooncakeError::invalid_argument(format!("unknown batch {batch}")))?;
        let (protocol, local_idx) = engine_batch
            .task_map
            .get(task_idx)
            .cloned()
            .ok_or_else(|| MooncakeError::invalid_argument(format!("unknown task {task_idx} in batch {batch}")))?;
        let transport_batch = *engine_batch
            .per_transport
            .get(&protocol)
            .ok_or_else(|| MooncakeError::invalid_argument(format!("no transport installed for protocol {protocol}")))?;
        self.transport_for(&protocol)?.get_transfer_status(transport_batch, local_idx)
    }

    pub fn free_batch(&self, batch: BatchId) -> MooncakeResult<()> {
        let mut batches = self.batches.lock().expect("engine batch table lock poisoned");
        let engine_batch = batches
            .get(&batch)
            .ok_or_else(|| MooncakeError::invalid_argument(format!("unknown batch {batch}")))?;
        for (protocol, transport_batch) in &engine_batch.per_transport {
            self.transport_for(protocol)?.free_batch(*transport_batch)?;
        }
        batches.remove(&batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::TcpTransport;
    use mooncake_common::{Config, Opcode};
    use mooncake_metadata::LocalMetadataStore;
    use std::sync::atomic::AtomicU16;
    use std::thread;
    use std::time::Duration;

    static NEXT_PORT: AtomicU16 = AtomicU16::new(25100);

    fn cfg() -> Config {
        let mut cfg = Config::default();
        cfg.handshake_port = NEXT_PORT.fetch_add(2, Ordering::Relaxed);
        cfg
    }

    #[test]
    fn end_to_end_write_through_engine_over_tcp() {
        let metadata: Arc<dyn MetadataClient> = Arc::new(LocalMetadataStore::new());

        let server_cfg = cfg();
        let server_port = server_cfg.handshake_port;
        let server_engine = TransferEngine::new(Arc::clone(&metadata));
        server_engine.add_transport("tcp", Arc::new(TcpTransport::new(Arc::clone(&metadata), server_cfg)));
        let mut server_buf = vec![0u8; 32];
        server_engine
            .register_local_memory(server_buf.as_mut_ptr() as u64, 32, "cpu:0", true, false)
            .unwrap();
        server_engine.install("127.0.0.1").unwrap();
        thread::sleep(Duration::from_millis(50));

        let client_engine = TransferEngine::new(Arc::clone(&metadata));
        client_engine.add_transport("tcp", Arc::new(TcpTransport::new(Arc::clone(&metadata), cfg())));
        let client_buf = vec![0x7Eu8; 32];
        client_engine
            .register_local_memory(client_buf.as_ptr() as u64, 32, "cpu:0", false, false)
            .unwrap();
        client_engine.install("127.0.0.1").unwrap();

        let server_segment_name = format!("127.0.0.1:{}", server_port.wrapping_add(1));
        let target_id = client_engine.open_segment(&server_segment_name).unwrap();

        let batch = client_engine.allocate_batch(1).unwrap();
        client_engine
            .submit_transfer(
                batch,
                vec![TransferRequest {
                    opcode: Opcode::Write,
                    source: client_buf.as_ptr() as u64,
                    target_id: u64::from(target_id) as i32,
                    target_offset: server_buf.as_ptr() as u64,
                    length: 32,
                }],
            )
            .unwrap();

        assert_eq!(client_engine.get_transfer_status(batch, 0).unwrap(), TransferStatus::Completed);
        assert_eq!(server_buf, client_buf);
        assert!(client_engine.free_batch(batch).is_ok());
    }
}
