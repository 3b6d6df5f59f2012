//! Error taxonomy shared across the transfer engine, RDMA transport,
//! replica allocator and object store.

use thiserror::Error;

/// Result type used throughout the Mooncake workspace.
pub type MooncakeResult<T> = Result<T, MooncakeError>;

/// Errors that can occur anywhere in the transfer engine, metadata client,
/// replica allocator or object store.
#[derive(Debug, Error)]
pub enum MooncakeError {
    /// Malformed user input, or an unknown batch id / task id.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `submit_transfer` would exceed the batch's capacity.
    #[error("submitting {requested} requests would exceed batch capacity {capacity}")]
    TooManyRequests { requested: usize, capacity: usize },

    /// A source or destination address does not fall within any
    /// registered buffer.
    #[error("address {addr:#x} (len {len}) is not within any registered buffer")]
    AddressNotRegistered { addr: u64, len: u64 },

    /// `free_batch` was called while tasks are still outstanding.
    #[error("batch {0} still has outstanding tasks")]
    BatchBusy(u64),

    /// No device satisfies the priority matrix for a selection.
    #[error("no device available for location {0:?}")]
    DeviceNotFound(String),

    /// A new memory registration overlaps an existing one.
    #[error("registration [{new_addr:#x}, {new_end:#x}) overlaps existing buffer {existing}")]
    AddressOverlapped {
        new_addr: u64,
        new_end: u64,
        existing: String,
    },

    /// DNS resolution failed while establishing a handshake connection.
    #[error("dns resolution failed for {0}")]
    DnsFail(String),

    /// A socket operation (connect/read/write) failed during handshake.
    #[error("socket error: {0}")]
    SocketFail(#[from] std::io::Error),

    /// A metadata document or handshake document failed to parse.
    #[error("malformed json: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// The peer rejected a handshake (`reply_msg` was non-empty).
    #[error("handshake rejected by peer: {0}")]
    RejectHandshake(String),

    /// A metadata-store operation failed or returned stale data.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Endpoint setup failed in the RDMA layer.
    #[error("endpoint error: {0}")]
    Endpoint(String),

    /// Context construction failed in the RDMA layer.
    #[error("context error: {0}")]
    Context(String),

    /// Allocation failure for a core structure (batch, task, slice).
    #[error("out of memory allocating {0}")]
    OutOfMemory(String),

    /// The buffer allocator has no room left for a shard of the
    /// requested size.
    #[error("buffer allocator overflow: requested {requested}, remaining {remaining}")]
    BufferOverflow { requested: u64, remaining: u64 },

    /// A shard index was out of range for the replica it was requested
    /// against.
    #[error("shard index {index} out of range (replica has {len} shards)")]
    ShardIndexOutOfRange { index: usize, len: usize },

    /// An allocation strategy could not produce a handle (all candidates
    /// excluded by `failed_handles`).
    #[error("no available handle for position {0}")]
    NoAvailableHandle(usize),

    /// An allocation strategy exhausted its retry budget without finding
    /// an eligible segment.
    #[error("no available segment after {0} attempts")]
    AvailableSegmentEmpty(usize),

    /// A replica-allocator lookup found no matching version.
    #[error("invalid version {version} for key {key:?}")]
    InvalidVersion { key: String, version: Option<u64> },

    /// A replica-allocator lookup found no matching key.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// `put` failed end-to-end after exhausting its retry budget.
    #[error("write failed for key {0:?} after exhausting retries")]
    WriteFail(String),

    /// `get` failed end-to-end after exhausting its retry budget.
    #[error("read failed for key {0:?} after exhausting retries")]
    InvalidRead(String),

    /// A replica was found in a state that could not satisfy the
    /// requested operation.
    #[error("invalid replica state for key {0:?}: {1}")]
    InvalidReplica(String, String),
}

impl MooncakeError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    pub fn endpoint(msg: impl Into<String>) -> Self {
        Self::Endpoint(msg.into())
    }

    pub fn context(msg: impl Into<String>) -> Self {
        Self::Context(msg.into())
    }

    /// Returns true if this error represents a transient condition that
    /// the caller's retry policy (§7 propagation policy) should act on
    /// rather than surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SocketFail(_)
                | Self::DnsFail(_)
                | Self::RejectHandshake(_)
                | Self::DeviceNotFound(_)
                | Self::Metadata(_)
        )
    }
}
