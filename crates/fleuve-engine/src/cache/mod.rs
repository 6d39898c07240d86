//! State cache: a versioned CAS map in front of the event store
//!
//! The cache is a latency device, never a source of truth. Entries may be
//! evicted at any moment; a reader that misses simply replays from snapshot
//! and events. The CAS discipline keeps invariant: a cached value is some
//! committed state, never ahead of the store.

mod memory;
mod nats;

use async_trait::async_trait;

use crate::workflow::InstanceState;

pub use memory::InMemoryStateCache;
pub use nats::NatsStateCache;

/// Error type for cache operations.
///
/// All cache errors are non-fatal to command processing: the repository
/// degrades to store loads and logs.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache codec error: {0}")]
    Codec(String),
}

/// Versioned CAS map from cache keys to instance state.
///
/// Keys are engine-composed (`wf.{workflow_type}.{workflow_id}`) so multiple
/// workflow types share one backend without collisions.
#[async_trait]
pub trait StateCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<InstanceState>, CacheError>;

    /// Store `value` iff the current entry is at `expected_version`, or
    /// absent. Returns false, after deleting the entry, when a different
    /// version is present; stale readers then reload from the store.
    async fn put_if_version(
        &self,
        key: &str,
        expected_version: i64,
        value: InstanceState,
    ) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Compose the cache key for one workflow instance.
pub fn cache_key(workflow_type: &str, workflow_id: &crate::workflow::WorkflowId) -> String {
    format!("wf.{workflow_type}.{workflow_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowId;

    #[test]
    fn test_cache_key_is_type_qualified() {
        let key = cache_key("order", &WorkflowId::new("ord-1"));
        assert_eq!(key, "wf.order.ord-1");
        assert_ne!(key, cache_key("invoice", &WorkflowId::new("ord-1")));
    }
}
