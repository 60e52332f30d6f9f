use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::ring::{InstanceDesc, RingDesc};

// A deliberately small key-value surface: just what ring views and the
// lifecycler need. Real deployments back this with a consensus store; the
// in-memory implementation below serves single-process setups and tests.

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key-value store failure: {0}")]
    Store(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// The current membership record under `key`. A missing key reads as an
    /// empty ring.
    async fn get_ring(&self, key: &str) -> Result<RingDesc, KvError>;

    /// Insert or refresh one instance's record under `key`.
    async fn update_instance(&self, key: &str, desc: InstanceDesc) -> Result<(), KvError>;

    /// Remove one instance's record under `key`.
    async fn remove_instance(&self, key: &str, id: &str) -> Result<(), KvError>;
}

#[derive(Default)]
pub struct MemoryKvStore {
    rings: RwLock<HashMap<String, RingDesc>>,
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_ring(&self, key: &str) -> Result<RingDesc, KvError> {
        Ok(self.rings.read().get(key).cloned().unwrap_or_default())
    }

    async fn update_instance(&self, key: &str, desc: InstanceDesc) -> Result<(), KvError> {
        let mut rings = self.rings.write();
        let ring = rings.entry(key.to_string()).or_default();
        ring.instances.insert(desc.id.clone(), desc);
        Ok(())
    }

    async fn remove_instance(&self, key: &str, id: &str) -> Result<(), KvError> {
        let mut rings = self.rings.write();
        if let Some(ring) = rings.get_mut(key) {
            ring.instances.remove(id);
        }
        Ok(())
    }
}
