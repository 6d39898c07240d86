//! In-process state cache backed by a concurrent map

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CacheError, StateCache};
use crate::workflow::InstanceState;

/// Single-process cache. The default for embedded deployments and tests;
/// multi-process deployments want [`NatsStateCache`](super::NatsStateCache)
/// so runners share warm state.
#[derive(Default)]
pub struct InMemoryStateCache {
    entries: DashMap<String, InstanceState>,
}

impl InMemoryStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateCache for InMemoryStateCache {
    async fn get(&self, key: &str) -> Result<Option<InstanceState>, CacheError> {
        Ok(self.entries.get(key).map(|entry| entry.clone()))
    }

    async fn put_if_version(
        &self,
        key: &str,
        expected_version: i64,
        value: InstanceState,
    ) -> Result<bool, CacheError> {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(value);
                Ok(true)
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().version == expected_version {
                    occupied.insert(value);
                    Ok(true)
                } else {
                    occupied.remove();
                    Ok(false)
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowId;
    use serde_json::json;

    fn state(version: i64) -> InstanceState {
        let mut state = InstanceState::new(WorkflowId::new("ord-1"), json!({"n": version}));
        state.version = version;
        state
    }

    #[tokio::test]
    async fn test_put_get() {
        let cache = InMemoryStateCache::new();
        assert!(cache.put_if_version("k", 0, state(1)).await.unwrap());

        let cached = cache.get("k").await.unwrap().unwrap();
        assert_eq!(cached.version, 1);
    }

    #[tokio::test]
    async fn test_cas_success_chain() {
        let cache = InMemoryStateCache::new();
        assert!(cache.put_if_version("k", 0, state(1)).await.unwrap());
        assert!(cache.put_if_version("k", 1, state(2)).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_cas_failure_deletes_entry() {
        let cache = InMemoryStateCache::new();
        assert!(cache.put_if_version("k", 0, state(2)).await.unwrap());

        // Stale writer expected version 0, entry is at 2: entry goes away.
        assert!(!cache.put_if_version("k", 0, state(1)).await.unwrap());
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_absent_entry_accepts_any_put() {
        let cache = InMemoryStateCache::new();
        assert!(cache.put_if_version("k", 41, state(42)).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().unwrap().version, 42);
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = InMemoryStateCache::new();
        cache.put_if_version("k", 0, state(1)).await.unwrap();
        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
