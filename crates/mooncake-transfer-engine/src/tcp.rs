//! A fully real TCP transport (§1 "Transport" examples list TCP
//! alongside RDMA and NVMe-oF). Segment names for this transport are
//! `host:port` strings naming the node's data-plane listener, so no
//! handshake round trip is needed before a connection can be opened:
//! the listener address is the segment's own identity.
//!
//! Deliberately synchronous, one TCP connection per slice: this
//! transport exists to make the engine's Batch/Task/Slice contract
//! exercisable end-to-end without real RDMA hardware, not to compete
//! with the RDMA transport's throughput.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mooncake_common::{
    BatchId, Config, DeviceDescriptor, MooncakeError, MooncakeResult, Opcode, SegmentId,
    TransferRequest,
};
use mooncake_metadata::MetadataClient;

use crate::model::{SliceStatus, TransferStatus};
use crate::registry::TransportRegistry;
use crate::transport::Transport;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const OP_READ: u8 = 0;
const OP_WRITE: u8 = 1;

/// Reads exactly `len` live bytes starting at `addr`.
///
/// Caller (ultimately `register_local_memory`) guarantees `addr` names
/// `len` bytes of memory that stay valid for the call's duration; this
/// is the same invariant the RDMA transport relies on for its MRs.
unsafe fn read_local(addr: u64, len: u64) -> Vec<u8> {
    let slice = std::slice::from_raw_parts(addr as *const u8, len as usize);
    slice.to_vec()
}

unsafe fn write_local(addr: u64, data: &[u8]) {
    let dst = std::slice::from_raw_parts_mut(addr as *mut u8, data.len());
    dst.copy_from_slice(data);
}

fn send_frame(
    stream: &mut TcpStream,
    opcode: u8,
    offset: u64,
    len: u64,
    payload: Option<&[u8]>,
) -> MooncakeResult<()> {
    stream.write_all(&[opcode])?;
    stream.write_all(&offset.to_be_bytes())?;
    stream.write_all(&len.to_be_bytes())?;
    if let Some(payload) = payload {
        stream.write_all(payload)?;
    }
    stream.flush()?;
    Ok(())
}

fn read_frame_header(stream: &mut TcpStream) -> MooncakeResult<(u8, u64, u64)> {
    let mut op = [0u8; 1];
    stream.read_exact(&mut op)?;
    let mut offset_buf = [0u8; 8];
    stream.read_exact(&mut offset_buf)?;
    let mut len_buf = [0u8; 8];
    stream.read_exact(&mut len_buf)?;
    Ok((op[0], u64::from_be_bytes(offset_buf), u64::from_be_bytes(len_buf)))
}

/// Live view of the local segment's registered buffers, consulted by the
/// data-listener thread on every inbound frame. Kept separate from
/// `TransportRegistry`'s own descriptor so the hot accept path never
/// contends with the (de)serialization-heavy segment-publish path.
#[derive(Default)]
struct LocalView {
    buffers: Vec<(u64, u64)>,
}

impl LocalView {
    fn covers(&self, addr: u64, len: u64) -> bool {
        self.buffers
            .iter()
            .any(|(base, size)| addr >= *base && addr.saturating_add(len) <= base.saturating_add(*size))
    }
}

pub struct TcpTransport {
    registry: TransportRegistry,
    data_port: u16,
    local_view: Arc<Mutex<LocalView>>,
    shutdown: Arc<AtomicBool>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(metadata: Arc<dyn MetadataClient>, config: Config) -> Self {
        let data_port = config.handshake_port.wrapping_add(1);
        Self {
            registry: TransportRegistry::new(metadata, "unset", "tcp", config),
            data_port,
            local_view: Arc::new(Mutex::new(LocalView::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
            listener_handle: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &TransportRegistry {
        &self.registry
    }

    fn data_listen_loop(listener: TcpListener, shutdown: Arc<AtomicBool>, local: Arc<Mutex<LocalView>>) {
        listener
            .set_nonblocking(true)
            .expect("tcp data listener must support nonblocking mode");
        while !shutdown.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, _peer)) => {
                    let local = Arc::clone(&local);
                    thread::spawn(move || Self::handle_connection(stream, &local));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(err) => {
                    tracing::warn!(%err, "tcp data listener accept failed");
                }
            }
        }
    }

    fn handle_connection(mut stream: TcpStream, local: &Arc<Mutex<LocalView>>) {
        let (op, offset, len) = match read_frame_header(&mut stream) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, "malformed tcp data frame header");
                return;
            }
        };

        let registered = local.lock().expect("local view lock poisoned").covers(offset, len);

        match op {
            OP_WRITE => {
                let mut payload = vec![0u8; len as usize];
                if stream.read_exact(&mut payload).is_err() {
                    return;
                }
                if registered {
                    // SAFETY: `registered` confirms `offset` falls within
                    // a buffer this process registered with exactly this
                    // length available.
                    unsafe { write_local(offset, &payload) };
                }
                let _ = stream.write_all(&[u8::from(registered)]);
            }
            OP_READ => {
                if !registered {
                    let _ = stream.write_all(&[0u8]);
                    return;
                }
                // SAFETY: see OP_WRITE.
                let data = unsafe { read_local(offset, len) };
                if stream.write_all(&[1u8]).is_err() {
                    return;
                }
                let _ = stream.write_all(&data);
            }
            _ => {
                tracing::warn!(opcode = op, "unknown tcp data opcode");
            }
        }
    }

    fn transfer_one_slice(
        &self,
        peer_addr: &str,
        opcode: Opcode,
        source_addr: u64,
        target_offset: u64,
        length: u64,
    ) -> MooncakeResult<()> {
        let mut stream = TcpStream::connect_timeout(
            &peer_addr
                .to_socket_addrs()
                .map_err(|_| MooncakeError::DnsFail(peer_addr.to_string()))?
                .next()
                .ok_or_else(|| MooncakeError::DnsFail(peer_addr.to_string()))?,
            CONNECT_TIMEOUT,
        )?;
        stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;
        stream.set_write_timeout(Some(CONNECT_TIMEOUT))?;

        match opcode {
            Opcode::Write => {
                // SAFETY: `build_tasks` already checked `source_addr` falls
                // within a buffer this process registered with room for
                // `length` bytes.
                let payload = unsafe { read_local(source_addr, length) };
                send_frame(&mut stream, OP_WRITE, target_offset, length, Some(&payload))?;
                let mut status = [0u8; 1];
                stream.read_exact(&mut status)?;
                if status[0] != 1 {
                    return Err(MooncakeError::endpoint("peer rejected write: address not registered"));
                }
            }
            Opcode::Read => {
                send_frame(&mut stream, OP_READ, target_offset, length, None)?;
                let mut status = [0u8; 1];
                stream.read_exact(&mut status)?;
                if status[0] != 1 {
                    return Err(MooncakeError::endpoint("peer rejected read: address not registered"));
                }
                let mut payload = vec![0u8; length as usize];
                stream.read_exact(&mut payload)?;
                // SAFETY: see the Write arm.
                unsafe { write_local(source_addr, &payload) };
            }
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn install(&self, local_server_name: &str) -> MooncakeResult<()> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.data_port))?;

        let advertised_name = format!("{local_server_name}:{}", self.data_port);
        self.registry.set_local_name(&advertised_name);
        self.registry.add_device(DeviceDescriptor {
            name: advertised_name,
            lid: 0,
            gid: [0u8; 16],
        });
        self.registry.publish_local_segment()?;

        let shutdown = Arc::clone(&self.shutdown);
        let local_view = Arc::clone(&self.local_view);
        let handle = thread::Builder::new()
            .name("mc-tcp-data".into())
            .spawn(move || Self::data_listen_loop(listener, shutdown, local_view))
            .map_err(|e| MooncakeError::context(format!("failed to spawn tcp data listener: {e}")))?;
        *self.listener_handle.lock().expect("listener handle lock poisoned") = Some(handle);
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
        self.registry
            .register_buffer(addr, length, location, vec![0], vec![0], remote_accessible, update_metadata)?;
        self.local_view.lock().expect("local view lock poisoned").buffers.push((addr, length));
        Ok(())
    }

    fn unregister_local_memory(&self, addr: u64, update_metadata: bool) -> MooncakeResult<()> {
        self.registry.unregister_buffer(addr, update_metadata)?;
        self.local_view
            .lock()
            .expect("local view lock poisoned")
            .buffers
            .retain(|(a, _)| *a != addr);
        Ok(())
    }

    fn open_segment(&self, name: &str) -> MooncakeResult<SegmentId> {
        self.registry.open_segment(name)
    }

    fn close_segment(&self, segment_id: SegmentId) -> MooncakeResult<()> {
        self.registry.close_segment(segment_id)
    }

    fn allocate_batch(&self, size: usize) -> MooncakeResult<BatchId> {
        self.registry.allocate_batch(size)
    }

    fn submit_transfer(&self, batch: BatchId, requests: Vec<TransferRequest>) -> MooncakeResult<()> {
        let tasks = self.registry.build_tasks(&requests)?;
        let batch_handle = self.registry.batch(batch)?;
        batch_handle.append_tasks(tasks.clone())?;

        for task in &tasks {
            let peer_name = self
                .registry
                .segment_name(task.target_segment_id)
                .ok_or_else(|| MooncakeError::invalid_argument("target segment was never opened"))?;

            let slices = task.with_slices(|s| s.clone());
            for (idx, slice) in slices.into_iter().enumerate() {
                let mut attempt = slice;
                loop {
                    match self.transfer_one_slice(
                        &peer_name,
                        attempt.opcode,
                        attempt.source_addr,
                        attempt.target_offset,
                        attempt.length,
                    ) {
                        Ok(()) => {
                            task.record_slice_success(attempt.length);
                            task.with_slices(|s| s[idx].status = SliceStatus::Success);
                            break;
                        }
                        Err(err) => {
                            let exhausted = attempt.record_failure();
                            tracing::warn!(%err, retry = attempt.retry_cnt, "tcp slice transfer failed");
                            if exhausted {
                                task.record_slice_failure();
                                task.with_slices(|s| s[idx].status = SliceStatus::Failed);
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn get_transfer_status(&self, batch: BatchId, task_idx: usize) -> MooncakeResult<TransferStatus> {
        self.registry.get_transfer_status(batch, task_idx)
    }

    fn free_batch(&self, batch: BatchId) -> MooncakeResult<()> {
        self.registry.free_batch(batch)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.listener_handle.lock().expect("listener handle lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooncake_metadata::LocalMetadataStore;
    use std::sync::atomic::AtomicU16;

    static NEXT_PORT: AtomicU16 = AtomicU16::new(23100);

    fn cfg_with_port() -> Config {
        let mut cfg = Config::default();
        cfg.handshake_port = NEXT_PORT.fetch_add(2, Ordering::Relaxed);
        cfg
    }

    #[test]
    fn round_trip_write_then_read_between_two_nodes() {
        let metadata: Arc<dyn MetadataClient> = Arc::new(LocalMetadataStore::new());

        let server_cfg = cfg_with_port();
        let server_port = server_cfg.handshake_port;
        let server = TcpTransport::new(Arc::clone(&metadata), server_cfg);
        let mut server_buf = vec![0u8; 64];
        server
            .register_local_memory(server_buf.as_mut_ptr() as u64, 64, "cpu:0", true, false)
            .unwrap();
        server.install("127.0.0.1").unwrap();
        thread::sleep(Duration::from_millis(50));

        let client_cfg = cfg_with_port();
        let client = TcpTransport::new(Arc::clone(&metadata), client_cfg);
        let client_buf = vec![0xABu8; 64];
        client
            .register_local_memory(client_buf.as_mut_ptr() as u64, 64, "cpu:0", false, false)
            .unwrap();
        client.install("127.0.0.1").unwrap();

        // `install` stamped the server's advertised name as
        // `<local_server_name>:<data_port>` and published it.
        let server_segment_name = format!("127.0.0.1:{}", server_port.wrapping_add(1));
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

        assert_eq!(client.get_transfer_status(batch, 0).unwrap(), TransferStatus::Completed);
        assert_eq!(server_buf, client_buf);
    }
}
