//! Peer segment-descriptor cache, refreshed synchronously on miss.
//!
//! `original_source`'s `transfer_metadata.h` keeps this separate from the
//! id cache (`segment_id.rs`): `getSegmentDescByName` refreshes through
//! the metadata client whenever the name isn't already cached. Both the
//! local engine and the RDMA worker's peer-descriptor lookup
//! (submit_post_send step 1) share one of these.

use std::collections::HashMap;
use std::sync::RwLock;

use mooncake_common::{MooncakeResult, SegmentDescriptor};

use crate::store::MetadataClient;

/// Reader-preferring cache of [`SegmentDescriptor`]s, keyed by segment
/// name. A cache miss synchronously calls through to the backing
/// [`MetadataClient`] and populates the cache before returning.
#[derive(Default)]
pub struct SegmentDescCache {
    cached: RwLock<HashMap<String, SegmentDescriptor>>,
}

impl SegmentDescCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the descriptor for `name`, refreshing through `client` on
    /// a cache miss.
    pub fn get(&self, client: &dyn MetadataClient, name: &str) -> MooncakeResult<SegmentDescriptor> {
        if let Some(desc) = self
            .cached
            .read()
            .expect("segment descriptor cache lock poisoned")
            .get(name)
        {
            return Ok(desc.clone());
        }

        let desc = client.get_segment(name)?;
        self.cached
            .write()
            .expect("segment descriptor cache lock poisoned")
            .insert(name.to_string(), desc.clone());
        Ok(desc)
    }

    /// Forces a refresh of `name` from `client`, overwriting any cached
    /// entry.
    pub fn refresh(&self, client: &dyn MetadataClient, name: &str) -> MooncakeResult<SegmentDescriptor> {
        let desc = client.get_segment(name)?;
        self.cached
            .write()
            .expect("segment descriptor cache lock poisoned")
            .insert(name.to_string(), desc.clone());
        Ok(desc)
    }

    /// Drops the cached entry for `name`, if any.
    pub fn invalidate(&self, name: &str) {
        self.cached
            .write()
            .expect("segment descriptor cache lock poisoned")
            .remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalMetadataStore;

    #[test]
    fn miss_populates_from_client() {
        let client = LocalMetadataStore::new();
        client
            .put_segment("node-a", &SegmentDescriptor::new("node-a", "rdma"))
            .unwrap();
        let cache = SegmentDescCache::new();
        let desc = cache.get(&client, "node-a").unwrap();
        assert_eq!(desc.name, "node-a");
    }

    #[test]
    fn refresh_overwrites_stale_entry() {
        let client = LocalMetadataStore::new();
        client
            .put_segment("node-a", &SegmentDescriptor::new("node-a", "rdma"))
            .unwrap();
        let cache = SegmentDescCache::new();
        cache.get(&client, "node-a").unwrap();

        let mut updated = SegmentDescriptor::new("node-a", "tcp");
        updated.protocol = "tcp".into();
        client.put_segment("node-a", &updated).unwrap();

        let stale = cache.get(&client, "node-a").unwrap();
        assert_eq!(stale.protocol, "rdma");

        let fresh = cache.refresh(&client, "node-a").unwrap();
        assert_eq!(fresh.protocol, "tcp");
    }

    #[test]
    fn invalidate_forces_next_get_to_refetch() {
        let client = LocalMetadataStore::new();
        client
            .put_segment("node-a", &SegmentDescriptor::new("node-a", "rdma"))
            .unwrap();
        let cache = SegmentDescCache::new();
        cache.get(&client, "node-a").unwrap();
        client.remove_segment("node-a").unwrap();
        cache.invalidate("node-a");
        assert!(cache.get(&client, "node-a").is_err());
    }
}
