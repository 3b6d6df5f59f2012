//! The metadata client's KV contract (§4.1) and an in-process stand-in
//! implementation for tests, standing in for an external placement
//! service (etcd/Redis in production) in integration tests.

use std::collections::HashMap;
use std::sync::RwLock;

use mooncake_common::{MooncakeError, MooncakeResult, SegmentDescriptor};

/// Publishes and fetches per-node segment descriptors in an external KV.
/// The spec explicitly scopes the KV service itself out of the core;
/// this trait is the contract the rest of the engine is written against.
pub trait MetadataClient: Send + Sync {
    fn put_segment(&self, name: &str, descriptor: &SegmentDescriptor) -> MooncakeResult<()>;
    fn get_segment(&self, name: &str) -> MooncakeResult<SegmentDescriptor>;
    fn remove_segment(&self, name: &str) -> MooncakeResult<()>;
}

/// Single-process `MetadataClient` backed by a `RwLock<HashMap>`, standing
/// in for an external KV (etcd and similar) in tests and single-binary
/// deployments. The lock favors readers; all mutations take the write
/// form exactly once per call.
#[derive(Debug, Default)]
pub struct LocalMetadataStore {
    segments: RwLock<HashMap<String, SegmentDescriptor>>,
}

impl LocalMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataClient for LocalMetadataStore {
    fn put_segment(&self, name: &str, descriptor: &SegmentDescriptor) -> MooncakeResult<()> {
        let mut segments = self
            .segments
            .write()
            .map_err(|_| MooncakeError::metadata("segment store lock poisoned"))?;
        segments.insert(name.to_string(), descriptor.clone());
        Ok(())
    }

    fn get_segment(&self, name: &str) -> MooncakeResult<SegmentDescriptor> {
        let segments = self
            .segments
            .read()
            .map_err(|_| MooncakeError::metadata("segment store lock poisoned"))?;
        segments
            .get(name)
            .cloned()
            .ok_or_else(|| MooncakeError::metadata(format!("segment {name:?} not found")))
    }

    fn remove_segment(&self, name: &str) -> MooncakeResult<()> {
        let mut segments = self
            .segments
            .write()
            .map_err(|_| MooncakeError::metadata("segment store lock poisoned"))?;
        segments.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str) -> SegmentDescriptor {
        SegmentDescriptor::new(name, "rdma")
    }

    #[test]
    fn put_then_get_roundtrips() {
        let store = LocalMetadataStore::new();
        store.put_segment("node-a", &desc("node-a")).unwrap();
        let fetched = store.get_segment("node-a").unwrap();
        assert_eq!(fetched.name, "node-a");
    }

    #[test]
    fn get_missing_segment_fails() {
        let store = LocalMetadataStore::new();
        assert!(store.get_segment("ghost").is_err());
    }

    #[test]
    fn remove_then_get_fails() {
        let store = LocalMetadataStore::new();
        store.put_segment("node-a", &desc("node-a")).unwrap();
        store.remove_segment("node-a").unwrap();
        assert!(store.get_segment("node-a").is_err());
    }

    #[test]
    fn put_overwrites_existing() {
        let store = LocalMetadataStore::new();
        store.put_segment("node-a", &desc("node-a")).unwrap();
        let mut updated = desc("node-a");
        updated.protocol = "tcp".into();
        store.put_segment("node-a", &updated).unwrap();
        assert_eq!(store.get_segment("node-a").unwrap().protocol, "tcp");
    }
}
