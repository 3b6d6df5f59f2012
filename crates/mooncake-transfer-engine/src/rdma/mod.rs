//! RDMA backend (§4.6): verbs abstraction, device/endpoint state
//! machines, and the [`transport::RdmaTransport`] facade. The real
//! ibverbs binding (`verbs_ffi`) is behind the non-default `rdma`
//! feature; [`fake::FakeRdmaDevice`] backs every test in this module and
//! is always available.

pub mod bounded_queue;
pub mod context;
pub mod endpoint;
pub mod fake;
pub mod provider;
pub mod transport;

#[cfg(feature = "rdma")]
pub mod verbs_ffi;

pub use context::RdmaContext;
pub use endpoint::Endpoint;
pub use provider::{
    CompletionResult, DeviceHandle, PeerQpInfo, PortAttr, PostDescriptor, QpConfig, QpHandle,
    VerbsProvider,
};
pub use transport::RdmaTransport;

#[cfg(feature = "rdma")]
pub use verbs_ffi::RealVerbsProvider;
