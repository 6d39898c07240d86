//! NATS JetStream KV state cache
//!
//! Out-of-process cache for multi-runner deployments. The version CAS rides
//! on the KV revision number: every update is conditional on the revision
//! read together with the value, so two racing runners cannot interleave a
//! lost update.

use async_nats::jetstream;
use async_nats::jetstream::kv;
use async_trait::async_trait;

use super::{CacheError, StateCache};
use crate::workflow::InstanceState;

fn backend<E: std::fmt::Display>(e: E) -> CacheError {
    CacheError::Backend(e.to_string())
}

/// State cache on a NATS JetStream key-value bucket.
pub struct NatsStateCache {
    store: kv::Store,
}

impl NatsStateCache {
    /// Wrap an existing KV bucket handle.
    pub fn new(store: kv::Store) -> Self {
        Self { store }
    }

    /// Connect to NATS and open (or create) the bucket.
    pub async fn connect(url: &str, bucket: &str) -> Result<Self, CacheError> {
        let client = async_nats::connect(url).await.map_err(backend)?;
        let jetstream = jetstream::new(client);

        let store = match jetstream.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => jetstream
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    ..Default::default()
                })
                .await
                .map_err(backend)?,
        };

        Ok(Self { store })
    }

    fn decode(bytes: &[u8]) -> Result<InstanceState, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
    }

    fn encode(value: &InstanceState) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(value).map_err(|e| CacheError::Codec(e.to_string()))
    }
}

#[async_trait]
impl StateCache for NatsStateCache {
    async fn get(&self, key: &str) -> Result<Option<InstanceState>, CacheError> {
        match self.store.entry(key).await.map_err(backend)? {
            Some(entry) => Ok(Some(Self::decode(&entry.value)?)),
            None => Ok(None),
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        expected_version: i64,
        value: InstanceState,
    ) -> Result<bool, CacheError> {
        let bytes = Self::encode(&value)?;

        match self.store.entry(key).await.map_err(backend)? {
            None => {
                // Fresh key: create fails if someone raced us in, in which
                // case the entry is dropped like any other CAS loss.
                match self.store.create(key, bytes.into()).await {
                    Ok(_) => Ok(true),
                    Err(_) => {
                        self.store.purge(key).await.map_err(backend)?;
                        Ok(false)
                    }
                }
            }
            Some(entry) => {
                let current = Self::decode(&entry.value)?;
                if current.version != expected_version {
                    self.store.purge(key).await.map_err(backend)?;
                    return Ok(false);
                }
                match self
                    .store
                    .update(key, bytes.into(), entry.revision)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(_) => {
                        // Revision moved between read and update.
                        self.store.purge(key).await.map_err(backend)?;
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.purge(key).await.map_err(backend)
    }
}
