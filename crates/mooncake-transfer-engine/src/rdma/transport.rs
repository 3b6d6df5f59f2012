//! The RDMA transport facade (§4.5, §4.6): ties a per-device
//! [`RdmaContext`], a peer-NIC-path-keyed [`Endpoint`] cache, the
//! handshake daemon, and a background transfer worker together behind
//! the [`Transport`] contract.
//!
//! Device selection (§4.5.5) runs twice per slice attempt: once against
//! the local segment's priority matrix (to pick which local NIC posts
//! the work request) and once against the peer's (to pick which of the
//! peer's rkeys/NICs the request targets), exactly as the retry count
//! escalates through both matrices identically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use mooncake_common::{
    BatchId, Config, MooncakeError, MooncakeResult, PriorityMatrix, SegmentId, TransferRequest,
};
use mooncake_metadata::{send_handshake, HandshakeDaemon, HandshakeDesc, MetadataClient};

use crate::device_selection::select_device;
use crate::model::{SliceStatus, Task, TransferStatus};
use crate::registry::TransportRegistry;
use crate::transport::Transport;

use super::bounded_queue::{BoundedQueue, PushResult};
use super::context::{parse_nic_path, RdmaContext};
use super::endpoint::Endpoint;
use super::provider::{PeerQpInfo, PostDescriptor, QpConfig, VerbsProvider};

const WORKER_BATCH: usize = 64;
const POLL_BATCH: usize = 64;
const PENDING_QUEUE_CAPACITY: usize = 16 * 1024;

struct PendingSlice {
    task: Arc<Task>,
    slice_idx: usize,
}

struct InflightEntry<P: VerbsProvider> {
    task: Arc<Task>,
    slice_idx: usize,
    endpoint: Arc<Endpoint<P>>,
    qp_idx: usize,
}

/// FIFO-capped endpoint cache (§4.6.2): at most `capacity` peer
/// connections held open at once, oldest evicted first.
struct EndpointCache<P: VerbsProvider> {
    map: HashMap<String, Arc<Endpoint<P>>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl<P: VerbsProvider> EndpointCache<P> {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &str) -> Option<Arc<Endpoint<P>>> {
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: String, endpoint: Arc<Endpoint<P>>) {
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        }
        self.map.insert(key, endpoint);
    }
}

struct Inner<P: VerbsProvider> {
    provider: Arc<P>,
    registry: TransportRegistry,
    devices: RwLock<HashMap<String, Arc<RdmaContext<P>>>>,
    endpoints: Mutex<EndpointCache<P>>,
    inflight: Mutex<HashMap<u64, InflightEntry<P>>>,
    next_wr_id: AtomicU64,
    pending: BoundedQueue<PendingSlice>,
    shutdown: AtomicBool,
}

impl<P: VerbsProvider + 'static> Inner<P> {
    fn device_ctx(&self, name: &str) -> MooncakeResult<Arc<RdmaContext<P>>> {
        self.devices
            .read()
            .expect("device table lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| MooncakeError::DeviceNotFound(name.to_string()))
    }

    fn qp_config(&self) -> QpConfig {
        let cfg = self.registry.config();
        QpConfig {
            max_wr: cfg.max_wr,
            max_sge: cfg.max_sge,
            max_inline: cfg.max_inline,
        }
    }

    fn enqueue_slice(&self, task: Arc<Task>, slice_idx: usize) {
        match self.pending.try_push(PendingSlice { task, slice_idx }) {
            PushResult::Pushed => {}
            PushResult::Full(item) => {
                tracing::warn!("rdma pending queue saturated, dropping slice");
                item.task.with_slices(|s| s[item.slice_idx].status = SliceStatus::Failed);
                item.task.record_slice_failure();
            }
        }
    }

    fn handle_slice_error(&self, task: &Arc<Task>, slice_idx: usize, err: &MooncakeError) {
        let exhausted = task.with_slices(|s| s[slice_idx].record_failure());
        tracing::warn!(%err, slice_idx, "rdma slice post failed");
        if exhausted {
            task.record_slice_failure();
            task.with_slices(|s| s[slice_idx].status = SliceStatus::Failed);
        } else {
            self.enqueue_slice(Arc::clone(task), slice_idx);
        }
    }

    /// §4.6.2/§4.6.3: returns a connected endpoint for `peer_nic_path`,
    /// reusing the cache if already connected, else performing an active
    /// handshake against `peer_segment_name` (a `host:port` reachable at
    /// its handshake listener) to drive the peer through RTR/RTS.
    fn get_or_connect_endpoint(
        &self,
        local_ctx: &Arc<RdmaContext<P>>,
        peer_segment_name: &str,
        peer_nic_path: &str,
        peer_lid: u16,
        peer_gid: [u8; 16],
    ) -> MooncakeResult<Arc<Endpoint<P>>> {
        let key = format!("{}->{}", local_ctx.nic_path(), peer_nic_path);
        if let Some(ep) = self.endpoints.lock().expect("endpoint cache lock poisoned").get(&key) {
            return Ok(ep);
        }

        let cfg = self.registry.config();
        let ep = Arc::new(Endpoint::new(
            Arc::clone(&self.provider),
            peer_nic_path.to_string(),
            cfg.num_qp_per_ep,
            self.qp_config(),
        ));
        ep.construct(local_ctx.device)?;

        let local_desc = HandshakeDesc {
            local_nic_path: local_ctx.nic_path(),
            peer_nic_path: peer_nic_path.to_string(),
            qp_num: ep.local_qp_nums(),
            reply_msg: String::new(),
        };
        let response = send_handshake(peer_segment_name, &local_desc)?;
        let peer_qps: Vec<PeerQpInfo> = response
            .qp_num
            .iter()
            .map(|&qp_num| PeerQpInfo { qp_num, lid: peer_lid, gid: peer_gid })
            .collect();
        ep.connect(&peer_qps, cfg.ib_port, cfg.mtu)?;

        self.endpoints
            .lock()
            .expect("endpoint cache lock poisoned")
            .insert(key, Arc::clone(&ep));
        Ok(ep)
    }

    /// Passive side of the handshake (§4.6.3): `req.peer_nic_path` names
    /// which of *our* devices the requester wants to connect to, per the
    /// wire field's meaning from the requester's point of view.
    fn handle_passive_handshake(&self, req: &HandshakeDesc) -> HandshakeDesc {
        let reject = |msg: &str| HandshakeDesc {
            local_nic_path: String::new(),
            peer_nic_path: String::new(),
            qp_num: Vec::new(),
            reply_msg: msg.to_string(),
        };

        let Some((device_name, _lid, _gid)) = parse_nic_path(&req.peer_nic_path) else {
            return reject("malformed nic path");
        };
        let Ok(ctx) = self.device_ctx(&device_name) else {
            return reject("unknown device");
        };
        let Some((_, peer_lid, peer_gid)) = parse_nic_path(&req.local_nic_path) else {
            return reject("malformed peer nic path");
        };

        let cfg = self.registry.config();
        let ep = Arc::new(Endpoint::new(
            Arc::clone(&self.provider),
            req.local_nic_path.clone(),
            cfg.num_qp_per_ep,
            self.qp_config(),
        ));
        if ep.construct(ctx.device).is_err() {
            return reject("failed to construct qps");
        }
        let peer_qps: Vec<PeerQpInfo> = req
            .qp_num
            .iter()
            .map(|&qp_num| PeerQpInfo { qp_num, lid: peer_lid, gid: peer_gid })
            .collect();
        if ep.connect(&peer_qps, cfg.ib_port, cfg.mtu).is_err() {
            return reject("failed to connect qps");
        }

        let key = format!("{}->{}", ctx.nic_path(), req.local_nic_path);
        self.endpoints
            .lock()
            .expect("endpoint cache lock poisoned")
            .insert(key, Arc::clone(&ep));

        HandshakeDesc {
            local_nic_path: ctx.nic_path(),
            peer_nic_path: req.local_nic_path.clone(),
            qp_num: ep.local_qp_nums(),
            reply_msg: String::new(),
        }
    }

    /// §4.5.4 `perform_post_send`: pops up to `max` pending slices,
    /// resolves device/endpoint/qp for each, and posts it. Returns how
    /// many were actually posted.
    fn perform_post_send(&self, max: usize) -> usize {
        let batch = self.pending.pop_batch(max);
        let mut posted = 0;
        for item in batch {
            match self.try_post_one(&item) {
                Ok(true) => posted += 1,
                Ok(false) => self.enqueue_slice(item.task, item.slice_idx),
                Err(err) => self.handle_slice_error(&item.task, item.slice_idx, &err),
            }
        }
        posted
    }

    fn try_post_one(&self, item: &PendingSlice) -> MooncakeResult<bool> {
        let slice = item.task.with_slices(|s| s[item.slice_idx].clone());
        let mut rng = rand::thread_rng();

        let local_seg = self.registry.with_local_segment(|seg| seg.clone());
        let local_buf = local_seg
            .buffer_for_range(slice.source_addr, 1)
            .ok_or(MooncakeError::AddressNotRegistered { addr: slice.source_addr, len: slice.length })?;
        let local_entry = local_seg.priority_matrix.get(&local_buf.name).cloned().unwrap_or_default();
        let local_idx = select_device(&local_entry, slice.retry_cnt, &mut rng)?;
        let local_device_name = local_entry.ordered()[local_idx].to_string();
        let local_ctx = self.device_ctx(&local_device_name)?;
        let lkey = local_ctx
            .lkey_for(slice.source_addr)
            .ok_or(MooncakeError::AddressNotRegistered { addr: slice.source_addr, len: slice.length })?;

        let peer_name = self
            .registry
            .segment_name(slice.target_segment_id)
            .ok_or_else(|| MooncakeError::invalid_argument("target segment was never opened"))?;
        let peer_desc = self.registry.desc_cache().get(self.registry.metadata(), &peer_name)?;
        let peer_buf = peer_desc
            .buffer_for_range(slice.target_offset, 1)
            .ok_or(MooncakeError::AddressNotRegistered { addr: slice.target_offset, len: slice.length })?;
        let peer_entry = peer_desc.priority_matrix.get(&peer_buf.name).cloned().unwrap_or_default();
        let peer_idx = select_device(&peer_entry, slice.retry_cnt, &mut rng)?;
        let peer_device_name = peer_entry.ordered()[peer_idx].to_string();
        let peer_device_idx = peer_desc
            .device_index(&peer_device_name)
            .ok_or_else(|| MooncakeError::DeviceNotFound(peer_device_name.clone()))?;
        let peer_device = &peer_desc.devices[peer_device_idx];
        let rkey = *peer_buf
            .rkey
            .get(peer_device_idx)
            .ok_or_else(|| MooncakeError::context("rkey table shorter than peer device index"))?;
        let peer_nic_path = format!("{}@{:04x}@{}", peer_device.name, peer_device.lid, peer_device.gid_hex());

        let endpoint = self.get_or_connect_endpoint(
            &local_ctx,
            &peer_name,
            &peer_nic_path,
            peer_device.lid,
            peer_device.gid,
        )?;

        let qp_idx = endpoint.pick_qp(&mut rng);
        if endpoint.reserve(qp_idx, 1) == 0 {
            return Ok(false);
        }

        let wr_id = self.next_wr_id.fetch_add(1, Ordering::Relaxed);
        let desc = PostDescriptor {
            wr_id,
            opcode: slice.opcode,
            local_addr: slice.source_addr,
            local_length: slice.length as u32,
            local_lkey: lkey,
            remote_addr: slice.target_offset,
            remote_rkey: rkey,
        };

        match self.provider.post_send(endpoint.qp_handle(qp_idx), &[desc]) {
            Ok(()) => {
                item.task.with_slices(|s| s[item.slice_idx].status = SliceStatus::Posted);
                self.inflight.lock().expect("inflight table lock poisoned").insert(
                    wr_id,
                    InflightEntry {
                        task: Arc::clone(&item.task),
                        slice_idx: item.slice_idx,
                        endpoint,
                        qp_idx,
                    },
                );
                Ok(true)
            }
            Err(err) => {
                endpoint.release(qp_idx, 1);
                Err(err)
            }
        }
    }

    /// §4.5.4 `perform_poll_cq`: drains completions from every open
    /// device and reconciles them against the in-flight map.
    fn perform_poll_cq(&self) -> usize {
        let device_names: Vec<String> =
            self.devices.read().expect("device table lock poisoned").keys().cloned().collect();
        let mut completed = 0;
        for name in device_names {
            let Ok(ctx) = self.device_ctx(&name) else { continue };
            let Ok(completions) = self.provider.poll_cq(ctx.device, POLL_BATCH) else { continue };
            for c in completions {
                let Some(entry) =
                    self.inflight.lock().expect("inflight table lock poisoned").remove(&c.wr_id)
                else {
                    continue;
                };
                entry.endpoint.release(entry.qp_idx, 1);
                if c.success {
                    let length = entry.task.with_slices(|s| s[entry.slice_idx].length);
                    entry.task.record_slice_success(length);
                    entry.task.with_slices(|s| s[entry.slice_idx].status = SliceStatus::Success);
                } else {
                    self.handle_slice_error(
                        &entry.task,
                        entry.slice_idx,
                        &MooncakeError::context("completion reported failure"),
                    );
                }
                completed += 1;
            }
        }
        completed
    }

    fn worker_loop(inner: Arc<Self>) {
        while !inner.shutdown.load(Ordering::Acquire) {
            let posted = inner.perform_post_send(WORKER_BATCH);
            let completed = inner.perform_poll_cq();
            if posted == 0 && completed == 0 {
                thread::sleep(inner.registry.config().worker_idle_wait());
            }
        }
    }
}

pub struct RdmaTransport<P: VerbsProvider + 'static> {
    inner: Arc<Inner<P>>,
    device_names: Vec<String>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    handshake_daemon: Mutex<Option<HandshakeDaemon>>,
}

impl<P: VerbsProvider + 'static> RdmaTransport<P> {
    pub fn new(
        provider: Arc<P>,
        metadata: Arc<dyn MetadataClient>,
        device_names: Vec<String>,
        config: Config,
    ) -> Self {
        let max_ep_per_ctx = config.max_ep_per_ctx;
        let pending = BoundedQueue::new(PENDING_QUEUE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                provider,
                registry: TransportRegistry::new(metadata, "unset", "rdma", config),
                devices: RwLock::new(HashMap::new()),
                endpoints: Mutex::new(EndpointCache::new(max_ep_per_ctx)),
                inflight: Mutex::new(HashMap::new()),
                next_wr_id: AtomicU64::new(1),
                pending,
                shutdown: AtomicBool::new(false),
            }),
            device_names,
            worker_handle: Mutex::new(None),
            handshake_daemon: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &TransportRegistry {
        &self.inner.registry
    }
}

impl<P: VerbsProvider + 'static> Transport for RdmaTransport<P> {
    fn install(&self, local_server_name: &str) -> MooncakeResult<()> {
        let cfg = self.inner.registry.config().clone();
        let advertised_name = format!("{local_server_name}:{}", cfg.handshake_port);
        self.inner.registry.set_local_name(&advertised_name);

        for name in &self.device_names {
            let ctx = Arc::new(RdmaContext::open(Arc::clone(&self.inner.provider), name, cfg.ib_port)?);
            self.inner.registry.add_device(ctx.device_descriptor());
            self.inner
                .devices
                .write()
                .expect("device table lock poisoned")
                .insert(name.clone(), ctx);
        }
        self.inner.registry.publish_local_segment()?;

        let handshake_inner = Arc::clone(&self.inner);
        let daemon = HandshakeDaemon::start(cfg.handshake_port, move |req| {
            handshake_inner.handle_passive_handshake(&req)
        })?;
        *self.handshake_daemon.lock().expect("handshake daemon lock poisoned") = Some(daemon);

        let worker_inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("mc-rdma-worker".into())
            .spawn(move || Inner::worker_loop(worker_inner))
            .map_err(|e| MooncakeError::context(format!("failed to spawn rdma worker: {e}")))?;
        *self.worker_handle.lock().expect("worker handle lock poisoned") = Some(handle);
        Ok(())
    }

    fn register_local_memory(
        &self,
        addr: u64,
        length: u64,
        location: &str,
        remote_accessible: bool,
        update_metadata: bool,
    ) -> MooncakeResult<()> {
        let mut rkeys = Vec::with_capacity(self.device_names.len());
        let mut lkeys = Vec::with_capacity(self.device_names.len());
        for name in &self.device_names {
            let ctx = self.inner.device_ctx(name)?;
            let (lkey, rkey) = ctx.register(addr, length)?;
            lkeys.push(lkey);
            rkeys.push(rkey);
        }
        self.inner
            .registry
            .register_buffer(addr, length, location, rkeys, lkeys, remote_accessible, update_metadata)
    }

    fn unregister_local_memory(&self, addr: u64, update_metadata: bool) -> MooncakeResult<()> {
        for name in &self.device_names {
            if let Ok(ctx) = self.inner.device_ctx(name) {
                let _ = ctx.unregister(addr);
            }
        }
        self.inner.registry.unregister_buffer(addr, update_metadata)
    }

    fn open_segment(&self, name: &str) -> MooncakeResult<SegmentId> {
        self.inner.registry.open_segment(name)
    }

    fn close_segment(&self, segment_id: SegmentId) -> MooncakeResult<()> {
        self.inner.registry.close_segment(segment_id)
    }

    fn allocate_batch(&self, size: usize) -> MooncakeResult<BatchId> {
        self.inner.registry.allocate_batch(size)
    }

    fn submit_transfer(&self, batch: BatchId, requests: Vec<TransferRequest>) -> MooncakeResult<()> {
        let tasks = self.inner.registry.build_tasks(&requests)?;
        self.inner.registry.batch(batch)?.append_tasks(tasks.clone())?;
        for task in tasks {
            let slice_count = task.slice_count();
            for idx in 0..slice_count {
                self.inner.enqueue_slice(Arc::clone(&task), idx);
            }
        }
        Ok(())
    }

    fn get_transfer_status(&self, batch: BatchId, task_idx: usize) -> MooncakeResult<TransferStatus> {
        self.inner.registry.get_transfer_status(batch, task_idx)
    }

    fn free_batch(&self, batch: BatchId) -> MooncakeResult<()> {
        self.inner.registry.free_batch(batch)
    }
}

impl<P: VerbsProvider + 'static> Drop for RdmaTransport<P> {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker_handle.lock().expect("worker handle lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

/// Sets the priority matrix on the underlying registry (§4.5.5). Exposed
/// directly since [`Transport`] has no matrix-specific method.
impl<P: VerbsProvider + 'static> RdmaTransport<P> {
    pub fn set_priority_matrix(&self, matrix: PriorityMatrix) {
        self.inner.registry.set_priority_matrix(matrix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::fake::FakeRdmaDevice;
    use mooncake_common::{Opcode, PriorityEntry};
    use mooncake_metadata::LocalMetadataStore;
    use std::sync::atomic::AtomicU16;
    use std::time::Duration;

    static NEXT_PORT: AtomicU16 = AtomicU16::new(24100);

    fn test_port() -> u16 {
        NEXT_PORT.fetch_add(1, Ordering::Relaxed)
    }

    fn matrix() -> PriorityMatrix {
        let mut m = PriorityMatrix::new();
        m.insert("cpu:0".into(), PriorityEntry { preferred: vec!["fake0".into()], fallback: vec![] });
        m
    }

    #[test]
    fn round_trip_write_completes_between_two_fake_nodes() {
        let metadata: Arc<dyn MetadataClient> = Arc::new(LocalMetadataStore::new());
        let provider = Arc::new(FakeRdmaDevice::new());

        let server_port = test_port();
        let mut server_cfg = Config::default();
        server_cfg.handshake_port = server_port;
        let server = RdmaTransport::new(Arc::clone(&provider), Arc::clone(&metadata), vec!["fake0".into()], server_cfg);
        server.set_priority_matrix(matrix());
        let mut server_buf = vec![0u8; 64];
        server
            .register_local_memory(server_buf.as_mut_ptr() as u64, 64, "cpu:0", true, false)
            .unwrap();
        server.install("127.0.0.1").unwrap();

        let client_port = test_port();
        let mut client_cfg = Config::default();
        client_cfg.handshake_port = client_port;
        let client = RdmaTransport::new(Arc::clone(&provider), Arc::clone(&metadata), vec!["fake0".into()], client_cfg);
        client.set_priority_matrix(matrix());
        let client_buf = vec![0xABu8; 64];
        client
            .register_local_memory(client_buf.as_ptr() as u64, 64, "cpu:0", false, false)
            .unwrap();
        client.install("127.0.0.1").unwrap();

        thread::sleep(Duration::from_millis(50));

        let server_segment_name = format!("127.0.0.1:{server_port}");
        let target_id = client.open_segment(&server_segment_name).unwrap();
        let batch = client.allocate_batch(1).unwrap();
        client
            .submit_transfer(
                batch,
                vec![TransferRequest {
                    opcode: Opcode::Write,
                    source: client_buf.as_ptr() as u64,
                    target_id: u64::from(target_id) as i32,
                    target_offset: server_buf.as_ptr() as u64,
                    length: 64,
                }],
            )
            .unwrap();

        let mut status = TransferStatus::Waiting;
        for _ in 0..200 {
            status = client.get_transfer_status(batch, 0).unwrap();
            if status != TransferStatus::Waiting {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(status, TransferStatus::Completed);
    }

    #[test]
    fn slice_fails_once_retry_cap_exhausted_with_no_matching_device() {
        let metadata: Arc<dyn MetadataClient> = Arc::new(LocalMetadataStore::new());
        let provider = Arc::new(FakeRdmaDevice::new());

        let server_port = test_port();
        let mut server_cfg = Config::default();
        server_cfg.handshake_port = server_port;
        server_cfg.retry_cnt = 2;
        let server = RdmaTransport::new(Arc::clone(&provider), Arc::clone(&metadata), vec!["fake0".into()], server_cfg);
        server.set_priority_matrix(matrix());
        let mut server_buf = vec![0u8; 64];
        server
            .register_local_memory(server_buf.as_mut_ptr() as u64, 64, "cpu:0", true, false)
            .unwrap();
        server.install("127.0.0.1").unwrap();

        let client_port = test_port();
        let mut client_cfg = Config::default();
        client_cfg.handshake_port = client_port;
        client_cfg.retry_cnt = 2;
        let client = RdmaTransport::new(Arc::clone(&provider), Arc::clone(&metadata), vec!["fake0".into()], client_cfg);
        // No priority matrix entry registered on the client: every local
        // device-selection attempt reports `DeviceNotFound`.
        let client_buf = vec![0xABu8; 64];
        client
            .register_local_memory(client_buf.as_ptr() as u64, 64, "cpu:0", false, false)
            .unwrap();
        client.install("127.0.0.1").unwrap();

        thread::sleep(Duration::from_millis(50));

        let server_segment_name = format!("127.0.0.1:{server_port}");
        let target_id = client.open_segment(&server_segment_name).unwrap();
        let batch = client.allocate_batch(1).unwrap();
        client
            .submit_transfer(
                batch,
                vec![TransferRequest {
                    opcode: Opcode::Write,
                    source: client_buf.as_ptr() as u64,
                    target_id: u64::from(target_id) as i32,
                    target_offset: server_buf.as_ptr() as u64,
                    length: 64,
                }],
            )
            .unwrap();

        let mut status = TransferStatus::Waiting;
        for _ in 0..20 {
            client.inner.perform_post_send(16);
            client.inner.perform_poll_cq();
            status = client.get_transfer_status(batch, 0).unwrap();
            if status != TransferStatus::Waiting {
                break;
            }
        }
        assert_eq!(status, TransferStatus::Failed);
    }

    #[test]
    fn endpoint_cache_evicts_oldest_past_capacity() {
        let provider = Arc::new(FakeRdmaDevice::new());
        let mut cache: EndpointCache<FakeRdmaDevice> = EndpointCache::new(2);
        let ep = |path: &str| Arc::new(Endpoint::new(Arc::clone(&provider), path.to_string(), 1, QpConfig { max_wr: 4, max_sge: 1, max_inline: 0 }));
        cache.insert("a".into(), ep("a"));
        cache.insert("b".into(), ep("b"));
        cache.insert("c".into(), ep("c"));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }
}
