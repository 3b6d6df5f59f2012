//! Per-device RDMA context (§4.6.1): opens the device, queries its port,
//! and tracks the memory regions registered against it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use mooncake_common::{DeviceDescriptor, MooncakeResult};

/// `"<device>@<lid hex>@<gid hex>"` -- enough to drive the peer side of a
/// handshake without a second metadata round trip (§6 nic path is an
/// opaque string; this is one transport's choice of what to pack in it).
pub fn parse_nic_path(path: &str) -> Option<(String, u16, [u8; 16])> {
    let mut parts = path.splitn(3, '@');
    let device = parts.next()?.to_string();
    let lid = u16::from_str_radix(parts.next()?, 16).ok()?;
    let gid = DeviceDescriptor::parse_gid(parts.next()?)?;
    Some((device, lid, gid))
}

use super::provider::{DeviceHandle, PortAttr, VerbsProvider};

pub struct RdmaContext<P: VerbsProvider> {
    provider: Arc<P>,
    pub device: DeviceHandle,
    pub device_name: String,
    pub port_attr: PortAttr,
    /// addr -> (lkey, rkey), consulted by `submit_post_send` to resolve a
    /// slice's source lkey (§4.6.4).
    mrs: RwLock<HashMap<u64, (u32, u32)>>,
}

impl<P: VerbsProvider> RdmaContext<P> {
    pub fn open(provider: Arc<P>, device_name: &str, ib_port: u8) -> MooncakeResult<Self> {
        let device = provider.open_device(device_name)?;
        let port_attr = provider.query_port(device, ib_port)?;
        Ok(Self {
            provider,
            device,
            device_name: device_name.to_string(),
            port_attr,
            mrs: RwLock::new(HashMap::new()),
        })
    }

    /// `"<device>@<lid>"`, used as the handshake NIC path (§6).
    pub fn nic_path(&self) -> String {
        format!("{}@{:04x}", self.device_name, self.port_attr.lid)
    }

    pub fn device_descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            name: self.device_name.clone(),
            lid: self.port_attr.lid,
            gid: self.port_attr.gid,
        }
    }

    pub fn register(&self, addr: u64, length: u64) -> MooncakeResult<(u32, u32)> {
        let keys = self.provider.register_memory_region(self.device, addr, length)?;
        self.mrs.write().expect("mr table lock poisoned").insert(addr, keys);
        Ok(keys)
    }

    pub fn unregister(&self, addr: u64) -> MooncakeResult<()> {
        self.provider.deregister_memory_region(self.device, addr)?;
        self.mrs.write().expect("mr table lock poisoned").remove(&addr);
        Ok(())
    }

    /// Linear scan for the lkey covering `addr`: table sizes are bounded
    /// by how many buffers one process registers, not by transfer volume.
    pub fn lkey_for(&self, addr: u64) -> Option<u32> {
        self.mrs.read().expect("mr table lock poisoned").get(&addr).map(|(lkey, _)| *lkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::fake::FakeRdmaDevice;

    #[test]
    fn register_then_lookup_returns_lkey() {
        let provider = Arc::new(FakeRdmaDevice::new());
        let ctx = RdmaContext::open(Arc::clone(&provider), "fake0", 1).unwrap();
        let (lkey, _rkey) = ctx.register(1000, 4096).unwrap();
        assert_eq!(ctx.lkey_for(1000), Some(lkey));
        ctx.unregister(1000).unwrap();
        assert_eq!(ctx.lkey_for(1000), None);
    }

    #[test]
    fn nic_path_embeds_device_name_and_lid() {
        let provider = Arc::new(FakeRdmaDevice::new());
        let ctx = RdmaContext::open(provider, "fake0", 1).unwrap();
        assert!(ctx.nic_path().starts_with("fake0@"));
    }
}
