use std::collections::HashMap;
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ClusterMap, RegistryError};

/// Process-local stand-in for the cluster-shared map.
#[derive(Default)]
pub struct LocalClusterMap {
    entries: RwLock<HashMap<String, Vec<String>>>,
}

impl LocalClusterMap {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { self.entries.read().len() }
    pub fn is_empty(&self) -> bool { self.entries.read().is_empty() }
}

#[async_trait]
impl ClusterMap for LocalClusterMap {
    async fn get(&self, key: &str) -> Result<Option<Vec<String>>, RegistryError> { Ok(self.entries.read().get(key).cloned()) }

    async fn put(&self, key: &str, values: Vec<String>) -> Result<(), RegistryError> {
        self.entries.write().insert(key.to_string(), values);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), RegistryError> {
        self.entries.write().remove(key);
        Ok(())
    }
}
