//! The metadata client (§4.1): segment-descriptor publishing, lazy
//! transport-local id assignment, and the peer-to-peer handshake
//! listener.

mod desc_cache;
mod handshake;
mod segment_id;
mod store;
mod wire;

pub use desc_cache::SegmentDescCache;
pub use handshake::{send_handshake, HandshakeDaemon, HandshakeDesc};
pub use segment_id::SegmentIdCache;
pub use store::{LocalMetadataStore, MetadataClient};
