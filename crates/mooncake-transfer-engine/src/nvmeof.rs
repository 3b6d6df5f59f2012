//! NVMe-oF transport marker (§1 lists NVMe-oF alongside RDMA and TCP as
//! a supported transport). Storage-backed transfer to a remote NVMe
//! target is out of scope here; this type exists so the transport
//! registry and `TransferEngine::install` can name the protocol and
//! reject use of it with a clear error instead of silently missing a
//! match arm.

use mooncake_common::{BatchId, MooncakeError, MooncakeResult, SegmentId, TransferRequest};

use crate::model::TransferStatus;
use crate::transport::Transport;

pub struct NvmeofTransport;

impl NvmeofTransport {
    pub fn new() -> Self {
        Self
    }

    fn unsupported() -> MooncakeError {
        MooncakeError::context("nvme-of transport is not implemented")
    }
}

impl Default for NvmeofTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for NvmeofTransport {
    fn install(&self, _local_server_name: &str) -> MooncakeResult<()> {
        Err(Self::unsupported())
    }

    fn register_local_memory(
        &self,
        _addr: u64,
        _length: u64,
        _location: &str,
        _remote_accessible: bool,
        _update_metadata: bool,
    ) -> MooncakeResult<()> {
        Err(Self::unsupported())
    }

    fn unregister_local_memory(&self, _addr: u64, _update_metadata: bool) -> MooncakeResult<()> {
        Err(Self::unsupported())
    }

    fn open_segment(&self, _name: &str) -> MooncakeResult<SegmentId> {
        Err(Self::unsupported())
    }

    fn close_segment(&self, _segment_id: SegmentId) -> MooncakeResult<()> {
        Err(Self::unsupported())
    }

    fn allocate_batch(&self, _size: usize) -> MooncakeResult<BatchId> {
        Err(Self::unsupported())
    }

    fn submit_transfer(&self, _batch: BatchId, _requests: Vec<TransferRequest>) -> MooncakeResult<()> {
        Err(Self::unsupported())
    }

    fn get_transfer_status(&self, _batch: BatchId, _task_idx: usize) -> MooncakeResult<TransferStatus> {
        Err(Self::unsupported())
    }

    fn free_batch(&self, _batch: BatchId) -> MooncakeResult<()> {
        Err(Self::unsupported())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_method_reports_unsupported() {
        let t = NvmeofTransport::new();
        assert!(t.install("node-a").is_err());
        assert!(t.open_segment("x").is_err());
        assert!(t.allocate_batch(1).is_err());
    }
}
