//! Peer-NIC-path connection state machine (§4.6.3): `num_qp` queue pairs
//! per peer, each driven independently through RESET→INIT→RTR→RTS, with
//! a per-QP in-flight depth counter consulted by `submit_post_send`
//! (§4.6.4) to bound how many work requests get posted at once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use mooncake_common::{Mtu, MooncakeError, MooncakeResult};
use rand::Rng;

use super::provider::{PeerQpInfo, QpConfig, QpHandle, VerbsProvider};
use crate::model::EndpointState;

pub struct Endpoint<P: VerbsProvider> {
    provider: Arc<P>,
    pub peer_nic_path: String,
    qp_cfg: QpConfig,
    max_qp_depth: u32,
    qps: Mutex<Vec<QpHandle>>,
    wr_depth: Vec<AtomicU32>,
    state: Mutex<EndpointState>,
}

impl<P: VerbsProvider> Endpoint<P> {
    pub fn new(provider: Arc<P>, peer_nic_path: String, num_qp: usize, qp_cfg: QpConfig) -> Self {
        Self {
            provider,
            peer_nic_path,
            qp_cfg,
            max_qp_depth: qp_cfg.max_wr,
            qps: Mutex::new(Vec::new()),
            wr_depth: (0..num_qp).map(|_| AtomicU32::new(0)).collect(),
            state: Mutex::new(EndpointState::Initializing),
        }
    }

    pub fn state(&self) -> EndpointState {
        *self.state.lock().expect("endpoint state lock poisoned")
    }

    /// Creates the backing QPs on `device` (§4.6.3 "construct").
    pub fn construct(&self, device: super::provider::DeviceHandle) -> MooncakeResult<()> {
        let mut qps = self.qps.lock().expect("endpoint qp table lock poisoned");
        for _ in 0..self.wr_depth.len() {
            qps.push(self.provider.create_qp(device, self.qp_cfg)?);
        }
        *self.state.lock().expect("endpoint state lock poisoned") = EndpointState::Unconnected;
        Ok(())
    }

    pub fn local_qp_nums(&self) -> Vec<u32> {
        self.qps
            .lock()
            .expect("endpoint qp table lock poisoned")
            .iter()
            .map(|qp| self.provider.qp_num(*qp))
            .collect()
    }

    /// Drives every QP through INIT→RTR→RTS against `peers` (one entry
    /// per QP, in order). Used symmetrically by the active (connecting)
    /// and passive (accepting) sides of the handshake.
    pub fn connect(&self, peers: &[PeerQpInfo], ib_port: u8, mtu: Mtu) -> MooncakeResult<()> {
        let qps = self.qps.lock().expect("endpoint qp table lock poisoned");
        if peers.len() != qps.len() {
            return Err(MooncakeError::endpoint(format!(
                "peer supplied {} qp(s), endpoint has {}",
                peers.len(),
                qps.len()
            )));
        }
        for (qp, peer) in qps.iter().zip(peers) {
            self.provider.modify_qp_to_init(*qp, ib_port)?;
            self.provider.modify_qp_to_rtr(*qp, *peer, mtu)?;
            self.provider.modify_qp_to_rts(*qp)?;
        }
        *self.state.lock().expect("endpoint state lock poisoned") = EndpointState::Connected;
        Ok(())
    }

    /// Drops every QP back to RESET and clears in-flight counters
    /// (§4.6.3 "reset").
    pub fn reset(&self) -> MooncakeResult<()> {
        let qps = self.qps.lock().expect("endpoint qp table lock poisoned");
        for qp in qps.iter() {
            self.provider.reset_qp(*qp)?;
        }
        for depth in &self.wr_depth {
            depth.store(0, Ordering::Release);
        }
        *self.state.lock().expect("endpoint state lock poisoned") = EndpointState::Unconnected;
        Ok(())
    }

    pub fn qp_count(&self) -> usize {
        self.wr_depth.len()
    }

    pub fn qp_handle(&self, idx: usize) -> QpHandle {
        self.qps.lock().expect("endpoint qp table lock poisoned")[idx]
    }

    pub fn pick_qp(&self, rng: &mut impl Rng) -> usize {
        rng.gen_range(0..self.wr_depth.len())
    }

    /// §4.6.4 step 2: reserves up to `want` slots on `qp_idx`, capped by
    /// `max_qp_depth - current_depth`. Returns the number actually
    /// reserved (may be zero if the QP is saturated).
    pub fn reserve(&self, qp_idx: usize, want: u32) -> u32 {
        let counter = &self.wr_depth[qp_idx];
        let mut current = counter.load(Ordering::Acquire);
        loop {
            let room = self.max_qp_depth.saturating_sub(current);
            let grant = room.min(want);
            if grant == 0 {
                return 0;
            }
            match counter.compare_exchange_weak(
                current,
                current + grant,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return grant,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release(&self, qp_idx: usize, count: u32) {
        self.wr_depth[qp_idx].fetch_sub(count, Ordering::AcqRel);
    }
}
