//! The polymorphic transport contract (§2 "Transport", §6 control
//! surface).

use mooncake_common::{BatchId, SegmentId, TransferRequest};
use mooncake_common::MooncakeResult;

use crate::model::TransferStatus;

/// Uniform contract implemented by `RdmaTransport`, `TcpTransport`, and
/// (as a marker only) `NvmeofTransport`.
pub trait Transport: Send + Sync {
    /// Runs the install sequence (§4.5.1): build per-device contexts,
    /// publish the local segment descriptor, start the handshake daemon.
    fn install(&self, local_server_name: &str) -> MooncakeResult<()>;

    /// Registers `[addr, addr+length)` as remotely-accessible memory
    /// under `location` (§4.5.2).
    fn register_local_memory(
        &self,
        addr: u64,
        length: u64,
        location: &str,
        remote_accessible: bool,
        update_metadata: bool,
    ) -> MooncakeResult<()>;

    /// Reverses `register_local_memory` for the buffer starting at `addr`.
    fn unregister_local_memory(&self, addr: u64, update_metadata: bool) -> MooncakeResult<()>;

    /// Resolves `name` to a transport-local [`SegmentId`], fetching and
    /// caching its descriptor on first use.
    fn open_segment(&self, name: &str) -> MooncakeResult<SegmentId>;

    /// Releases any local resources opened for `segment_id`. Does not
    /// affect the segment's metadata-store entry.
    fn close_segment(&self, segment_id: SegmentId) -> MooncakeResult<()>;

    /// Allocates a batch descriptor that can hold up to `size` tasks
    /// (§4.5.3).
    fn allocate_batch(&self, size: usize) -> MooncakeResult<BatchId>;

    /// Slices and submits `requests` against `batch` (§4.5.3).
    fn submit_transfer(&self, batch: BatchId, requests: Vec<TransferRequest>) -> MooncakeResult<()>;

    /// Reports the tri-state status of one task within a batch.
    fn get_transfer_status(&self, batch: BatchId, task_idx: usize) -> MooncakeResult<TransferStatus>;

    /// Releases a batch, failing with `BatchBusy` if any task is still
    /// outstanding.
    fn free_batch(&self, batch: BatchId) -> MooncakeResult<()>;
}
