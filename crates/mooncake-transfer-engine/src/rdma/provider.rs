//! Backend-agnostic verbs surface (§4.6). `RdmaTransport`, `RdmaContext`
//! and `Endpoint` are generic over this trait: the real ibverbs backend
//! (`verbs_ffi`, feature `rdma`) and [`super::fake::FakeRdmaDevice`]
//! (test-only) both implement it, so context/endpoint/worker-pool logic
//! is written and tested once.
//!
//! Rather than a build-time flag that injects a fixed failure rate into
//! the real device, `FakeRdmaDevice` is a distinct, explicit
//! implementation that tests opt into deliberately.

use mooncake_common::MooncakeResult;

/// Opaque handle to an opened device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Opaque handle to one queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QpHandle(pub u64);

/// Port attributes read back after `open_device` (§4.6.1 step 2).
#[derive(Debug, Clone, Copy)]
pub struct PortAttr {
    pub lid: u16,
    pub gid: [u8; 16],
}

/// Queue-pair construction parameters (§4.6.3 "construct").
#[derive(Debug, Clone, Copy)]
pub struct QpConfig {
    pub max_wr: u32,
    pub max_sge: u32,
    pub max_inline: u32,
}

/// The peer-side QP attributes needed to drive RESET→INIT→RTR→RTS
/// (§4.6.3), obtained via the metadata client's handshake exchange.
#[derive(Debug, Clone, Copy)]
pub struct PeerQpInfo {
    pub qp_num: u32,
    pub lid: u16,
    pub gid: [u8; 16],
}

/// One post-send work request (§4.6.4): a single slice's RDMA
/// read/write, already resolved to a source lkey and destination
/// rkey/vaddr by the caller.
#[derive(Debug, Clone, Copy)]
pub struct PostDescriptor {
    pub wr_id: u64,
    pub opcode: mooncake_common::Opcode,
    pub local_addr: u64,
    pub local_length: u32,
    pub local_lkey: u32,
    pub remote_addr: u64,
    pub remote_rkey: u32,
}

/// One completion-queue entry (§4.5.4 `perform_poll_cq`).
#[derive(Debug, Clone, Copy)]
pub struct CompletionResult {
    pub wr_id: u64,
    pub success: bool,
}

/// The subset of libibverbs/rdmacm this engine depends on, abstracted so
/// it can be swapped for a fake in tests.
pub trait VerbsProvider: Send + Sync {
    fn open_device(&self, name: &str) -> MooncakeResult<DeviceHandle>;
    fn query_port(&self, device: DeviceHandle, port: u8) -> MooncakeResult<PortAttr>;
    fn create_qp(&self, device: DeviceHandle, cfg: QpConfig) -> MooncakeResult<QpHandle>;
    fn qp_num(&self, qp: QpHandle) -> u32;

    fn modify_qp_to_init(&self, qp: QpHandle, port: u8) -> MooncakeResult<()>;
    fn modify_qp_to_rtr(&self, qp: QpHandle, peer: PeerQpInfo, mtu: mooncake_common::Mtu) -> MooncakeResult<()>;
    fn modify_qp_to_rts(&self, qp: QpHandle) -> MooncakeResult<()>;
    fn reset_qp(&self, qp: QpHandle) -> MooncakeResult<()>;

    /// Registers `[addr, addr+length)`, returning (lkey, rkey).
    fn register_memory_region(&self, device: DeviceHandle, addr: u64, length: u64) -> MooncakeResult<(u32, u32)>;
    fn deregister_memory_region(&self, device: DeviceHandle, addr: u64) -> MooncakeResult<()>;

    fn post_send(&self, qp: QpHandle, wrs: &[PostDescriptor]) -> MooncakeResult<()>;
    /// Drains at most `max` completions currently ready on `device`'s CQ.
    fn poll_cq(&self, device: DeviceHandle, max: usize) -> MooncakeResult<Vec<CompletionResult>>;
}
