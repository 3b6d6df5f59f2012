//! Identifiers, wire descriptors, error taxonomy and environment
//! configuration shared by every crate in the transfer engine workspace.

mod config;
mod descriptor;
mod error;
mod ids;

pub use config::{Config, Mtu};
pub use descriptor::{
    BufferDescriptor, DeviceDescriptor, NvmeofBufferDescriptor, Opcode, PriorityEntry,
    PriorityMatrix, SegmentDescriptor, TransferRequest,
};
pub use error::{MooncakeError, MooncakeResult};
pub use ids::{BatchId, BufferIndex, ReplicaId, SegmentId, Version};
