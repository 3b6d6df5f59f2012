//! Zero-copy batch transfer engine: Batch/Task/Slice lifecycle (§3),
//! pluggable RDMA/TCP/NVMe-oF transports (§4.5, §4.6), and the
//! [`engine::TransferEngine`] facade tying them to one metadata client.

pub mod device_selection;
pub mod engine;
pub mod model;
pub mod nvmeof;
pub mod rdma;
pub mod registry;
pub mod tcp;
pub mod transport;

pub use engine::TransferEngine;
pub use model::{Batch, EndpointState, RdmaSlicePayload, Slice, SliceStatus, Task, TransferStatus};
pub use nvmeof::NvmeofTransport;
pub use registry::TransportRegistry;
pub use tcp::TcpTransport;
pub use transport::Transport;
