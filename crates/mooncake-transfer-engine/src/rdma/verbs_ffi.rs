//! Real libibverbs/rdmacm-backed [`VerbsProvider`] (§4.6), feature-gated
//! behind `rdma` since it links against `librdmacm`/`libibverbs` and
//! needs InfiniBand/RoCE hardware to actually exercise.

use std::collections::HashMap;
use std::ffi::CString;
use std::ptr;
use std::sync::Mutex;

use mooncake_common::{Mtu, MooncakeError, MooncakeResult, Opcode};
use rdma_sys::*;

use super::provider::{
    CompletionResult, DeviceHandle, PeerQpInfo, PortAttr, PostDescriptor, QpConfig, QpHandle,
    VerbsProvider,
};

fn mtu_to_ibv(mtu: Mtu) -> u32 {
    match mtu {
        Mtu::Mtu512 => ibv_mtu::IBV_MTU_512 as u32,
        Mtu::Mtu1024 => ibv_mtu::IBV_MTU_1024 as u32,
        Mtu::Mtu2048 => ibv_mtu::IBV_MTU_2048 as u32,
        Mtu::Mtu4096 => ibv_mtu::IBV_MTU_4096 as u32,
    }
}

struct DeviceState {
    context: *mut ibv_context,
    pd: *mut ibv_pd,
    cq: *mut ibv_cq,
    port: u8,
    /// addr -> (mr pointer, lkey, rkey)
    mrs: HashMap<u64, (*mut ibv_mr, u32, u32)>,
}

// SAFETY: every field is a pointer into memory owned exclusively by this
// device's context, accessed only while holding `RealVerbsProvider`'s
// top-level lock.
unsafe impl Send for DeviceState {}

struct QpState {
    qp: *mut ibv_qp,
    device: DeviceHandle,
}

unsafe impl Send for QpState {}

/// Real ibverbs-backed provider. One instance owns however many device
/// contexts the engine opens; `DeviceHandle`/`QpHandle` index into its
/// internal tables.
#[derive(Default)]
pub struct RealVerbsProvider {
    devices: Mutex<Vec<DeviceState>>,
    qps: Mutex<Vec<QpState>>,
}

impl RealVerbsProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

// SAFETY: RealVerbsProvider serializes all access to its device/qp
// tables behind `Mutex`; the raw pointers inside never escape without
// that lock held.
unsafe impl Sync for RealVerbsProvider {}

impl VerbsProvider for RealVerbsProvider {
    fn open_device(&self, name: &str) -> MooncakeResult<DeviceHandle> {
        let mut num_devices = 0i32;
        // SAFETY: ibv_get_device_list returns a valid, null-terminated
        // array of device pointers or null on failure; we check for null
        // before dereferencing and free the list once we've resolved the
        // one we want.
        unsafe {
            let list = ibv_get_device_list(&mut num_devices);
            if list.is_null() {
                return Err(MooncakeError::context(format!("ibv_get_device_list failed opening {name}")));
            }
            let mut found: *mut ibv_device = ptr::null_mut();
            for i in 0..num_devices {
                let dev = *list.offset(i as isize);
                let dev_name = ibv_get_device_name(dev);
                if dev_name.is_null() {
                    continue;
                }
                let dev_name = std::ffi::CStr::from_ptr(dev_name).to_string_lossy();
                if dev_name == name {
                    found = dev;
                    break;
                }
            }
            if found.is_null() {
                ibv_free_device_list(list);
                return Err(MooncakeError::context(format!("rdma device {name} not found")));
            }
            let context = ibv_open_device(found);
            ibv_free_device_list(list);
            if context.is_null() {
                return Err(MooncakeError::context(format!("ibv_open_device failed for {name}")));
            }

            let pd = ibv_alloc_pd(context);
            if pd.is_null() {
                ibv_close_device(context);
                return Err(MooncakeError::context("ibv_alloc_pd failed"));
            }

            let cq = ibv_create_cq(context, 4096, ptr::null_mut(), ptr::null_mut(), 0);
            if cq.is_null() {
                ibv_dealloc_pd(pd);
                ibv_close_device(context);
                return Err(MooncakeError::context("ibv_create_cq failed"));
            }

            let mut devices = self.devices.lock().expect("rdma device table lock poisoned");
            let handle = DeviceHandle(devices.len() as u64);
            devices.push(DeviceState {
                context,
                pd,
                cq,
                port: 1,
                mrs: HashMap::new(),
            });
            Ok(handle)
        }
    }

    fn query_port(&self, device: DeviceHandle, port: u8) -> MooncakeResult<PortAttr> {
        let mut devices = self.devices.lock().expect("rdma device table lock poisoned");
        let state = devices
            .get_mut(device.0 as usize)
            .ok_or_else(|| MooncakeError::context("unknown rdma device handle"))?;
        state.port = port;

        // SAFETY: `state.context` was returned by a successful
        // `ibv_open_device` and is still live.
        unsafe {
            let mut port_attr: ibv_port_attr = std::mem::zeroed();
            if ibv_query_port(state.context, port as u8, &mut port_attr) != 0 {
                return Err(MooncakeError::context("ibv_query_port failed"));
            }
            let mut gid: ibv_gid = std::mem::zeroed();
            if ibv_query_gid(state.context, port as u8, 3, &mut gid) != 0 {
                return Err(MooncakeError::context("ibv_query_gid failed"));
            }
            Ok(PortAttr {
                lid: port_attr.lid,
                gid: gid.raw,
            })
        }
    }

    fn create_qp(&self, device: DeviceHandle, cfg: QpConfig) -> MooncakeResult<QpHandle> {
        let devices = self.devices.lock().expect("rdma device table lock poisoned");
        let state = devices
            .get(device.0 as usize)
            .ok_or_else(|| MooncakeError::context("unknown rdma device handle"))?;

        // SAFETY: `pd`/`cq` are live for as long as `state` is, which
        // outlives this call under the held lock.
        let qp = unsafe {
            let mut attr: ibv_qp_init_attr = std::mem::zeroed();
            attr.send_cq = state.cq;
            attr.recv_cq = state.cq;
            attr.qp_type = ibv_qp_type::IBV_QPT_RC;
            attr.cap.max_send_wr = cfg.max_wr;
            attr.cap.max_recv_wr = cfg.max_wr;
            attr.cap.max_send_sge = cfg.max_sge;
            attr.cap.max_recv_sge = cfg.max_sge;
            attr.cap.max_inline_data = cfg.max_inline;
            ibv_create_qp(state.pd, &mut attr)
        };
        if qp.is_null() {
            return Err(MooncakeError::endpoint("ibv_create_qp failed"));
        }

        drop(devices);
        let mut qps = self.qps.lock().expect("rdma qp table lock poisoned");
        let handle = QpHandle(qps.len() as u64);
        qps.push(QpState { qp, device });
        Ok(handle)
    }

    fn qp_num(&self, qp: QpHandle) -> u32 {
        let qps = self.qps.lock().expect("rdma qp table lock poisoned");
        // SAFETY: `qp` is a live ibv_qp created by `create_qp`.
        unsafe { (*qps[qp.0 as usize].qp).qp_num }
    }

    fn modify_qp_to_init(&self, qp: QpHandle, port: u8) -> MooncakeResult<()> {
        let qps = self.qps.lock().expect("rdma qp table lock poisoned");
        let raw = qps[qp.0 as usize].qp;
        // SAFETY: `raw` is live; `attr` is fully initialized before use.
        unsafe {
            let mut attr: ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
            attr.pkey_index = 0;
            attr.port_num = port;
            attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
                .0;
            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ibv_qp_attr_mask::IBV_QP_PORT
                | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            if ibv_modify_qp(raw, &mut attr, mask.0 as i32) != 0 {
                return Err(MooncakeError::endpoint("ibv_modify_qp to INIT failed"));
            }
        }
        Ok(())
    }

    fn modify_qp_to_rtr(&self, qp: QpHandle, peer: PeerQpInfo, mtu: Mtu) -> MooncakeResult<()> {
        let qps = self.qps.lock().expect("rdma qp table lock poisoned");
        let raw = qps[qp.0 as usize].qp;
        // SAFETY: see `modify_qp_to_init`.
        unsafe {
            let mut attr: ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
            attr.path_mtu = mtu_to_ibv(mtu);
            attr.dest_qp_num = peer.qp_num;
            attr.rq_psn = 0;
            attr.max_dest_rd_atomic = 1;
            attr.min_rnr_timer = 12;
            attr.ah_attr.is_global = 1;
            attr.ah_attr.dlid = peer.lid;
            attr.ah_attr.sl = 0;
            attr.ah_attr.src_path_bits = 0;
            attr.ah_attr.port_num = 1;
            attr.ah_attr.grh.dgid.raw = peer.gid;
            attr.ah_attr.grh.sgid_index = 3;
            attr.ah_attr.grh.hop_limit = 1;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
            if ibv_modify_qp(raw, &mut attr, mask.0 as i32) != 0 {
                return Err(MooncakeError::endpoint("ibv_modify_qp to RTR failed"));
            }
        }
        Ok(())
    }

    fn modify_qp_to_rts(&self, qp: QpHandle) -> MooncakeResult<()> {
        let qps = self.qps.lock().expect("rdma qp table lock poisoned");
        let raw = qps[qp.0 as usize].qp;
        // SAFETY: see `modify_qp_to_init`.
        unsafe {
            let mut attr: ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            attr.timeout = 14;
            attr.retry_cnt = 7;
            attr.rnr_retry = 7;
            attr.sq_psn = 0;
            attr.max_rd_atomic = 1;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
            if ibv_modify_qp(raw, &mut attr, mask.0 as i32) != 0 {
                return Err(MooncakeError::endpoint("ibv_modify_qp to RTS failed"));
            }
        }
        Ok(())
    }

    fn reset_qp(&self, qp: QpHandle) -> MooncakeResult<()> {
        let qps = self.qps.lock().expect("rdma qp table lock poisoned");
        let raw = qps[qp.0 as usize].qp;
        // SAFETY: see `modify_qp_to_init`.
        unsafe {
            let mut attr: ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RESET;
            if ibv_modify_qp(raw, &mut attr, ibv_qp_attr_mask::IBV_QP_STATE.0 as i32) != 0 {
                return Err(MooncakeError::endpoint("ibv_modify_qp to RESET failed"));
            }
        }
        Ok(())
    }

    fn register_memory_region(&self, device: DeviceHandle, addr: u64, length: u64) -> MooncakeResult<(u32, u32)> {
        let mut devices = self.devices.lock().expect("rdma device table lock poisoned");
        let state = devices
            .get_mut(device.0 as usize)
            .ok_or_else(|| MooncakeError::context("unknown rdma device handle"))?;

        let access = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
            .0 as i32;

        // SAFETY: `addr` names `length` bytes the caller guarantees stay
        // live for as long as this MR is registered; `state.pd` is live.
        let mr = unsafe { ibv_reg_mr(state.pd, addr as *mut std::ffi::c_void, length as usize, access) };
        if mr.is_null() {
            return Err(MooncakeError::context(format!("ibv_reg_mr failed for addr {addr:#x} len {length}")));
        }
        // SAFETY: `mr` was just returned non-null by ibv_reg_mr.
        let (lkey, rkey) = unsafe { ((*mr).lkey, (*mr).rkey) };
        state.mrs.insert(addr, (mr, lkey, rkey));
        Ok((lkey, rkey))
    }

    fn deregister_memory_region(&self, device: DeviceHandle, addr: u64) -> MooncakeResult<()> {
        let mut devices = self.devices.lock().expect("rdma device table lock poisoned");
        let state = devices
            .get_mut(device.0 as usize)
            .ok_or_else(|| MooncakeError::context("unknown rdma device handle"))?;
        if let Some((mr, _, _)) = state.mrs.remove(&addr) {
            // SAFETY: `mr` was registered against this same pd and is
            // removed from the table before deregistration, so it cannot
            // be double-freed.
            unsafe {
                ibv_dereg_mr(mr);
            }
        }
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wrs: &[PostDescriptor]) -> MooncakeResult<()> {
        let qps = self.qps.lock().expect("rdma qp table lock poisoned");
        let raw = qps[qp.0 as usize].qp;

        for wr in wrs {
            // SAFETY: `sge`/`send_wr` are fully initialized before being
            // passed to `ibv_post_send`; `raw` is a live QP.
            unsafe {
                let mut sge: ibv_sge = std::mem::zeroed();
                sge.addr = wr.local_addr;
                sge.length = wr.local_length;
                sge.lkey = wr.local_lkey;

                let mut send_wr: ibv_send_wr = std::mem::zeroed();
                send_wr.wr_id = wr.wr_id;
                send_wr.sg_list = &mut sge;
                send_wr.num_sge = 1;
                send_wr.opcode = match wr.opcode {
                    Opcode::Write => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
                    Opcode::Read => ibv_wr_opcode::IBV_WR_RDMA_READ,
                };
                send_wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
                send_wr.wr.rdma.remote_addr = wr.remote_addr;
                send_wr.wr.rdma.rkey = wr.remote_rkey;

                let mut bad_wr: *mut ibv_send_wr = ptr::null_mut();
                if ibv_post_send(raw, &mut send_wr, &mut bad_wr) != 0 {
                    return Err(MooncakeError::endpoint("ibv_post_send failed"));
                }
            }
        }
        Ok(())
    }

    fn poll_cq(&self, device: DeviceHandle, max: usize) -> MooncakeResult<Vec<CompletionResult>> {
        let devices = self.devices.lock().expect("rdma device table lock poisoned");
        let state = devices
            .get(device.0 as usize)
            .ok_or_else(|| MooncakeError::context("unknown rdma device handle"))?;

        let mut wc: Vec<ibv_wc> = Vec::with_capacity(max);
        // SAFETY: `wc` has `max` reserved, uninitialized slots;
        // `ibv_poll_cq` writes at most that many and returns the count
        // actually written, which we then trust when calling `set_len`.
        let n = unsafe {
            wc.set_len(max);
            let n = ibv_poll_cq(state.cq, max as i32, wc.as_mut_ptr());
            if n < 0 {
                return Err(MooncakeError::endpoint("ibv_poll_cq failed"));
            }
            n as usize
        };
        Ok(wc[..n]
            .iter()
            .map(|w| CompletionResult {
                wr_id: w.wr_id,
                success: w.status == ibv_wc_status::IBV_WC_SUCCESS,
            })
            .collect())
    }
}

impl Drop for RealVerbsProvider {
    fn drop(&mut self) {
        let mut devices = self.devices.lock().expect("rdma device table lock poisoned");
        for state in devices.drain(..) {
            // SAFETY: every resource here was opened by this same struct
            // and is dropped exactly once, in dependency order.
            unsafe {
                for (mr, _, _) in state.mrs.values() {
                    ibv_dereg_mr(*mr);
                }
                ibv_destroy_cq(state.cq);
                ibv_dealloc_pd(state.pd);
                ibv_close_device(state.context);
            }
        }
    }
}

/// Builds the NIC path string used in handshake documents (§6):
/// `"<device_name>@<gid or lid>"`. Kept here since it is only meaningful
/// once a device has actually been opened.
pub fn nic_path(device_name: &str, port_attr: &PortAttr) -> String {
    let _ = CString::new(device_name.to_string());
    format!("{device_name}@{:04x}", port_attr.lid)
}
