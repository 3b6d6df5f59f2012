//! Test-only [`VerbsProvider`] that simulates device/QP/CQ bookkeeping
//! entirely in memory, with no real hardware or network I/O. Completions
//! are synchronous: `post_send` enqueues a success completion for every
//! work request immediately, so the state-machine and worker-pool tests
//! built on it are deterministic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use mooncake_common::{Mtu, MooncakeError, MooncakeResult};

use super::provider::{
    CompletionResult, DeviceHandle, PeerQpInfo, PortAttr, PostDescriptor, QpConfig, QpHandle,
    VerbsProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FakeQpState {
    Reset,
    Init,
    Rtr,
    Rts,
}

struct FakeQp {
    state: FakeQpState,
}

#[derive(Default)]
pub struct FakeRdmaDevice {
    next_device: AtomicU64,
    next_qp: AtomicU64,
    next_key: AtomicU32,
    qps: Mutex<Vec<FakeQp>>,
    completions: Mutex<VecDeque<CompletionResult>>,
    /// Forces every subsequent `post_send` to fail once, then clears.
    inject_post_failure: Mutex<bool>,
}

impl FakeRdmaDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: the next `post_send` call reports failure for every
    /// work request it was given, instead of synthesizing completions.
    pub fn inject_next_post_failure(&self) {
        *self.inject_post_failure.lock().expect("fake device lock poisoned") = true;
    }

    pub fn completed_count(&self) -> usize {
        self.completions.lock().expect("fake device lock poisoned").len()
    }
}

impl VerbsProvider for FakeRdmaDevice {
    fn open_device(&self, _name: &str) -> MooncakeResult<DeviceHandle> {
        Ok(DeviceHandle(self.next_device.fetch_add(1, Ordering::Relaxed)))
    }

    fn query_port(&self, device: DeviceHandle, _port: u8) -> MooncakeResult<PortAttr> {
        Ok(PortAttr {
            lid: (device.0 as u16).wrapping_add(1),
            gid: [device.0 as u8; 16],
        })
    }

    fn create_qp(&self, _device: DeviceHandle, _cfg: QpConfig) -> MooncakeResult<QpHandle> {
        let id = self.next_qp.fetch_add(1, Ordering::Relaxed);
        self.qps
            .lock()
            .expect("fake device lock poisoned")
            .push(FakeQp { state: FakeQpState::Reset });
        Ok(QpHandle(id))
    }

    fn qp_num(&self, qp: QpHandle) -> u32 {
        qp.0 as u32 + 1000
    }

    fn modify_qp_to_init(&self, qp: QpHandle, _port: u8) -> MooncakeResult<()> {
        self.set_state(qp, FakeQpState::Reset, FakeQpState::Init)
    }

    fn modify_qp_to_rtr(&self, qp: QpHandle, _peer: PeerQpInfo, _mtu: Mtu) -> MooncakeResult<()> {
        self.set_state(qp, FakeQpState::Init, FakeQpState::Rtr)
    }

    fn modify_qp_to_rts(&self, qp: QpHandle) -> MooncakeResult<()> {
        self.set_state(qp, FakeQpState::Rtr, FakeQpState::Rts)
    }

    fn reset_qp(&self, qp: QpHandle) -> MooncakeResult<()> {
        let mut qps = self.qps.lock().expect("fake device lock poisoned");
        let slot = qps
            .get_mut(qp.0 as usize)
            .ok_or_else(|| MooncakeError::endpoint("unknown qp"))?;
        slot.state = FakeQpState::Reset;
        Ok(())
    }

    fn register_memory_region(&self, _device: DeviceHandle, _addr: u64, _length: u64) -> MooncakeResult<(u32, u32)> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        Ok((key, key))
    }

    fn deregister_memory_region(&self, _device: DeviceHandle, _addr: u64) -> MooncakeResult<()> {
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wrs: &[PostDescriptor]) -> MooncakeResult<()> {
        {
            let qps = self.qps.lock().expect("fake device lock poisoned");
            let slot = qps
                .get(qp.0 as usize)
                .ok_or_else(|| MooncakeError::endpoint("unknown qp"))?;
            if slot.state != FakeQpState::Rts {
                return Err(MooncakeError::endpoint("post_send on a qp that is not RTS"));
            }
        }

        let mut inject = self.inject_post_failure.lock().expect("fake device lock poisoned");
        let force_fail = *inject;
        *inject = false;
        drop(inject);

        let mut completions = self.completions.lock().expect("fake device lock poisoned");
        for wr in wrs {
            completions.push_back(CompletionResult {
                wr_id: wr.wr_id,
                success: !force_fail,
            });
        }
        Ok(())
    }

    fn poll_cq(&self, _device: DeviceHandle, max: usize) -> MooncakeResult<Vec<CompletionResult>> {
        let mut completions = self.completions.lock().expect("fake device lock poisoned");
        let drained = completions.len().min(max);
        Ok(completions.drain(..drained).collect())
    }
}

impl FakeRdmaDevice {
    fn set_state(&self, qp: QpHandle, expect: FakeQpState, next: FakeQpState) -> MooncakeResult<()> {
        let mut qps = self.qps.lock().expect("fake device lock poisoned");
        let slot = qps
            .get_mut(qp.0 as usize)
            .ok_or_else(|| MooncakeError::endpoint("unknown qp"))?;
        if slot.state != expect {
            return Err(MooncakeError::endpoint(format!(
                "qp state transition {:?} -> {:?} invalid from {:?}",
                expect, next, slot.state
            )));
        }
        slot.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mooncake_common::Opcode;

    fn peer() -> PeerQpInfo {
        PeerQpInfo { qp_num: 1, lid: 1, gid: [0u8; 16] }
    }

    #[test]
    fn qp_lifecycle_rejects_out_of_order_transitions() {
        let dev = FakeRdmaDevice::new();
        let handle = dev.open_device("fake0").unwrap();
        let qp = dev
            .create_qp(handle, QpConfig { max_wr: 16, max_sge: 4, max_inline: 64 })
            .unwrap();
        assert!(dev.modify_qp_to_rtr(qp, peer(), Mtu::Mtu4096).is_err());
        dev.modify_qp_to_init(qp, 1).unwrap();
        dev.modify_qp_to_rtr(qp, peer(), Mtu::Mtu4096).unwrap();
        dev.modify_qp_to_rts(qp).unwrap();
    }

    #[test]
    fn post_send_before_rts_fails() {
        let dev = FakeRdmaDevice::new();
        let handle = dev.open_device("fake0").unwrap();
        let qp = dev
            .create_qp(handle, QpConfig { max_wr: 16, max_sge: 4, max_inline: 64 })
            .unwrap();
        let wr = PostDescriptor {
            wr_id: 1,
            opcode: Opcode::Write,
            local_addr: 0,
            local_length: 4,
            local_lkey: 1,
            remote_addr: 0,
            remote_rkey: 1,
        };
        assert!(dev.post_send(qp, &[wr]).is_err());
    }

    #[test]
    fn post_send_then_poll_cq_reports_success() {
        let dev = FakeRdmaDevice::new();
        let handle = dev.open_device("fake0").unwrap();
        let qp = dev
            .create_qp(handle, QpConfig { max_wr: 16, max_sge: 4, max_inline: 64 })
            .unwrap();
        dev.modify_qp_to_init(qp, 1).unwrap();
        dev.modify_qp_to_rtr(qp, peer(), Mtu::Mtu4096).unwrap();
        dev.modify_qp_to_rts(qp).unwrap();

        let wr = PostDescriptor {
            wr_id: 42,
            opcode: Opcode::Write,
            local_addr: 0,
            local_length: 4,
            local_lkey: 1,
            remote_addr: 0,
            remote_rkey: 1,
        };
        dev.post_send(qp, &[wr]).unwrap();
        let completions = dev.poll_cq(handle, 10).unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].wr_id, 42);
        assert!(completions[0].success);
    }

    #[test]
    fn injected_failure_is_reported_once() {
        let dev = FakeRdmaDevice::new();
        let handle = dev.open_device("fake0").unwrap();
        let qp = dev
            .create_qp(handle, QpConfig { max_wr: 16, max_sge: 4, max_inline: 64 })
            .unwrap();
        dev.modify_qp_to_init(qp, 1).unwrap();
        dev.modify_qp_to_rtr(qp, peer(), Mtu::Mtu4096).unwrap();
        dev.modify_qp_to_rts(qp).unwrap();

        dev.inject_next_post_failure();
        let wr = PostDescriptor {
            wr_id: 1,
            opcode: Opcode::Write,
            local_addr: 0,
            local_length: 4,
            local_lkey: 1,
            remote_addr: 0,
            remote_rkey: 1,
        };
        dev.post_send(qp, &[wr]).unwrap();
        let completions = dev.poll_cq(handle, 10).unwrap();
        assert!(!completions[0].success);

        dev.post_send(qp, &[wr]).unwrap();
        let completions = dev.poll_cq(handle, 10).unwrap();
        assert!(completions[0].success);
    }
}
