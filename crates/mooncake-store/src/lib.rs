//! Replica-aware distributed object store (§4.3, §4.4): a sharded,
//! multi-version object layout backed by pluggable allocation strategy,
//! and the `put`/`get`/`remove`/`replicate`/`check_all` facade that
//! drives it over a [`mooncake_transfer_engine::TransferEngine`].

mod allocator;
mod replica;
mod requests;
mod store;
mod strategy;

pub use allocator::{shard_sizes_for, ReplicaAllocator, DEFAULT_SHARD_SIZE};
pub use replica::{ReplicaChange, ReplicaDiff, ReplicaInfo, ReplicaStatus, ReplicateConfig, VersionInfo, VersionList};
pub use requests::{generate_read_requests, generate_write_requests, reconcile_shard_statuses, IoVec, RequestOutcome};
pub use store::{DistributedObjectStore, ObjectStoreConfig, PutConfig};
pub use strategy::{AllocationStrategy, HandleCandidate, RandomStrategy};
