//! Wire-level descriptor types (§6 metadata store format, §3 data model).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Transfer opcode, shared by [`TransferRequest`] and by slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
    Read,
    Write,
}

/// One user-visible transfer request, as submitted to `submit_transfer`
/// and as it appears on the wire (§6 "Transfer request wire layout").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub opcode: Opcode,
    pub source: u64,
    pub target_id: i32,
    pub target_offset: u64,
    pub length: u64,
}

/// One NIC belonging to a segment. Immutable after context construction;
/// its position in [`SegmentDescriptor::devices`] is its *device index*,
/// referenced by rkey/lkey arrays and priority lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub lid: u16,
    /// 16-byte GID, hex-encoded with no separators on the wire
    /// (`"hh:hh:..."` per §6 is the human-readable rendering;
    /// `Self::gid_hex`/`Self::parse_gid` convert to/from it).
    pub gid: [u8; 16],
}

impl DeviceDescriptor {
    pub fn gid_hex(&self) -> String {
        self.gid.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn parse_gid(hex: &str) -> Option<[u8; 16]> {
        if hex.len() != 32 {
            return None;
        }
        let mut out = [0u8; 16];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            out[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(out)
    }
}

/// A registered memory region inside a segment: base address, length,
/// location tag, one rkey/lkey per device in the owning segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    /// Location tag, e.g. `cpu:0`.
    pub name: String,
    pub addr: u64,
    pub length: u64,
    /// One rkey per device index in the owning segment.
    pub rkey: Vec<u32>,
    /// One lkey per device index in the owning segment.
    pub lkey: Vec<u32>,
}

impl BufferDescriptor {
    pub fn end(&self) -> u64 {
        self.addr + self.length
    }

    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.addr && addr.saturating_add(len) <= self.end()
    }

    pub fn overlaps(&self, other_addr: u64, other_len: u64) -> bool {
        let other_end = other_addr.saturating_add(other_len);
        self.addr < other_end && other_addr < self.end()
    }
}

/// NVMe-oF buffer descriptor. Referenced only as an example of the
/// transport contract (§1); no NVMe-oF transport is implemented here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeofBufferDescriptor {
    pub file_path: String,
    pub length: u64,
    pub local_path_map: HashMap<String, String>,
}

/// Per-location-tag device preference used for RDMA device selection
/// (§4.5.5): preferred device names, then fallback device names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityEntry {
    pub preferred: Vec<String>,
    pub fallback: Vec<String>,
}

impl PriorityEntry {
    /// `T = ordered list (preferred ++ fallback)` per §9's restatement of
    /// the device-selection policy.
    pub fn ordered(&self) -> Vec<&str> {
        self.preferred
            .iter()
            .chain(self.fallback.iter())
            .map(String::as_str)
            .collect()
    }

    pub fn total(&self) -> usize {
        self.preferred.len() + self.fallback.len()
    }
}

/// Map from location tag to its [`PriorityEntry`].
pub type PriorityMatrix = HashMap<String, PriorityEntry>;

/// A named, externally-advertised container of remotely-accessible
/// memory on one node (§3 "Segment").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub name: String,
    pub protocol: String,
    pub devices: Vec<DeviceDescriptor>,
    #[serde(default)]
    pub buffers: Vec<BufferDescriptor>,
    #[serde(default)]
    pub nvmeof_buffers: Vec<NvmeofBufferDescriptor>,
    #[serde(default)]
    pub priority_matrix: PriorityMatrix,
}

impl SegmentDescriptor {
    pub fn new(name: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
            devices: Vec::new(),
            buffers: Vec::new(),
            nvmeof_buffers: Vec::new(),
            priority_matrix: PriorityMatrix::new(),
        }
    }

    /// Finds the device index by name (position in `devices`).
    pub fn device_index(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.name == name)
    }

    /// Finds the buffer descriptor covering `[addr, addr+len)`, if any.
    pub fn buffer_for_range(&self, addr: u64, len: u64) -> Option<&BufferDescriptor> {
        self.buffers.iter().find(|b| b.contains(addr, len))
    }

    /// Returns true if `[addr, addr+len)` overlaps any already-registered
    /// buffer (§8 invariant 2, `AddressOverlapped`).
    pub fn overlaps_any(&self, addr: u64, len: u64) -> Option<&BufferDescriptor> {
        self.buffers.iter().find(|b| b.overlaps(addr, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gid_roundtrips_through_hex() {
        let dev = DeviceDescriptor {
            name: "mlx5_0".into(),
            lid: 1,
            gid: [0xAB; 16],
        };
        let hex = dev.gid_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(DeviceDescriptor::parse_gid(&hex), Some(dev.gid));
    }

    #[test]
    fn buffer_contains_and_overlaps() {
        let buf = BufferDescriptor {
            name: "cpu:0".into(),
            addr: 1000,
            length: 100,
            rkey: vec![1],
            lkey: vec![2],
        };
        assert!(buf.contains(1000, 50));
        assert!(buf.contains(1050, 50));
        assert!(!buf.contains(1050, 51));
        assert!(!buf.contains(900, 50));

        assert!(buf.overlaps(1090, 50));
        assert!(buf.overlaps(950, 60));
        assert!(!buf.overlaps(1100, 10));
        assert!(!buf.overlaps(500, 100));
    }

    #[test]
    fn priority_entry_orders_preferred_before_fallback() {
        let entry = PriorityEntry {
            preferred: vec!["mlx5_0".into(), "mlx5_1".into()],
            fallback: vec!["mlx5_2".into()],
        };
        assert_eq!(entry.ordered(), vec!["mlx5_0", "mlx5_1", "mlx5_2"]);
        assert_eq!(entry.total(), 3);
    }

    #[test]
    fn segment_descriptor_json_roundtrip() {
        let mut desc = SegmentDescriptor::new("node-a", "rdma");
        desc.devices.push(DeviceDescriptor {
            name: "mlx5_0".into(),
            lid: 7,
            gid: [0u8; 16],
        });
        let json = serde_json::to_string(&desc).unwrap();
        let back: SegmentDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(desc, back);
    }
}
