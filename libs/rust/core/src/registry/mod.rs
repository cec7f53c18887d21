//! Capability registry: cluster-wide directory of type name -> provider addresses.
//!
//! Mutations are read-modify-write cycles against a shared map, serialized by
//! a named lock so concurrent register/unregister never lose an update. Reads
//! go straight to the map.

pub mod announce;
pub mod lock;
pub mod memory;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

pub use announce::ProviderAnnouncer;
pub use lock::{ExpiringLock, HeldLock, LocalLockManager, LockManager, ReleaseOnce};
pub use memory::LocalClusterMap;

use crate::metrics_ext::CORE_METRICS;

pub const LOCK_PREFIX: &str = "typemesh.registry.lock";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("lock on {key} expired after {after:?}; operation abandoned")]
    LockTimeout { key: String, after: Duration },
    #[error("registry backend error: {0}")]
    Backend(String),
    #[error("registry entry codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn is_lock_timeout(&self) -> bool { matches!(self, RegistryError::LockTimeout { .. }) }
}

/// Cluster-shared key -> address list storage.
#[async_trait]
pub trait ClusterMap: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<String>>, RegistryError>;
    async fn put(&self, key: &str, values: Vec<String>) -> Result<(), RegistryError>;
    async fn remove(&self, key: &str) -> Result<(), RegistryError>;
}

/// What routers and providers see of the registry.
#[async_trait]
pub trait CapabilityDirectory: Send + Sync {
    async fn register(&self, key: &str, value: &str) -> Result<(), RegistryError>;
    async fn unregister(&self, key: &str, value: &str) -> Result<(), RegistryError>;
    async fn get(&self, key: &str) -> Result<BTreeSet<String>, RegistryError>;
}

/// Lock granularity: one lock per key, or one lock for the whole registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope { #[default] PerKey, Global }

#[derive(Debug, Clone, Copy)]
enum Change<'a> { Add(&'a str), Remove(&'a str) }

impl Change<'_> {
    fn op(&self) -> &'static str { match self { Change::Add(_) => "register", Change::Remove(_) => "unregister" } }
}

pub struct CapabilityRegistry {
    map: Arc<dyn ClusterMap>,
    locks: Arc<dyn LockManager>,
    scope: LockScope,
}

impl CapabilityRegistry {
    pub fn new(map: Arc<dyn ClusterMap>, locks: Arc<dyn LockManager>, scope: LockScope) -> Self { Self { map, locks, scope } }

    /// Single-node registry backed by in-process map and locks.
    pub fn local() -> Self { Self::new(Arc::new(LocalClusterMap::new()), Arc::new(LocalLockManager::new()), LockScope::PerKey) }

    pub fn lock_name(&self, key: &str) -> String {
        match self.scope { LockScope::PerKey => format!("{LOCK_PREFIX}.{key}"), LockScope::Global => LOCK_PREFIX.to_string() }
    }

    /// The unlocked three-step cycle; callers hold the lock.
    async fn read_modify_write(&self, key: &str, change: Change<'_>) -> Result<(), RegistryError> {
        let current = self.map.get(key).await?;
        match change {
            Change::Add(value) => {
                let mut values = current.unwrap_or_default();
                if values.iter().any(|v| v == value) { debug!(%key, %value, "provider_already_registered"); return Ok(()); }
                values.push(value.to_string());
                self.map.put(key, values).await
            }
            Change::Remove(value) => {
                let Some(mut values) = current else { return Ok(()) };
                let before = values.len();
                values.retain(|v| v != value);
                if values.len() == before { return Ok(()); }
                if values.is_empty() { self.map.remove(key).await } else { self.map.put(key, values).await }
            }
        }
    }

    async fn locked(&self, key: &str, change: Change<'_>) -> Result<(), RegistryError> {
        let name = self.lock_name(key);
        let held = ReleaseOnce::new(name.clone(), self.locks.acquire(&name).await?);
        let result = self.read_modify_write(key, change).await;
        held.release().await;
        record_mutation(change, &result);
        result
    }

    async fn lookup(&self, key: &str) -> Result<BTreeSet<String>, RegistryError> {
        Ok(self.map.get(key).await?.unwrap_or_default().into_iter().collect())
    }
}

fn record_mutation(change: Change<'_>, result: &Result<(), RegistryError>) {
    let outcome = match result { Ok(()) => "ok", Err(RegistryError::LockTimeout { .. }) => "lock_timeout", Err(_) => "error" };
    CORE_METRICS.registry.mutations_total.add(1, &[KeyValue::new("op", change.op()), KeyValue::new("outcome", outcome)]);
}

#[async_trait]
impl CapabilityDirectory for CapabilityRegistry {
    #[instrument(skip(self), level = "debug")]
    async fn register(&self, key: &str, value: &str) -> Result<(), RegistryError> { self.locked(key, Change::Add(value)).await }

    #[instrument(skip(self), level = "debug")]
    async fn unregister(&self, key: &str, value: &str) -> Result<(), RegistryError> { self.locked(key, Change::Remove(value)).await }

    async fn get(&self, key: &str) -> Result<BTreeSet<String>, RegistryError> { self.lookup(key).await }
}

/// Registry whose write locks expire: an operation still running at the
/// deadline is failed with [`RegistryError::LockTimeout`] and its lock freed,
/// so a hung caller never wedges a key.
pub struct WriteLockRegistry {
    inner: CapabilityRegistry,
    deadline: Duration,
}

impl WriteLockRegistry {
    pub fn new(map: Arc<dyn ClusterMap>, locks: Arc<dyn LockManager>, scope: LockScope, deadline: Duration) -> Self {
        Self { inner: CapabilityRegistry::new(map, locks, scope), deadline }
    }

    async fn locked(&self, key: &str, change: Change<'_>) -> Result<(), RegistryError> {
        let name = self.inner.lock_name(key);
        let lock = ExpiringLock::acquire(self.inner.locks.as_ref(), &name, key, self.deadline).await?;
        let result = lock.run(self.inner.read_modify_write(key, change)).await;
        record_mutation(change, &result);
        result
    }
}

#[async_trait]
impl CapabilityDirectory for WriteLockRegistry {
    #[instrument(skip(self), level = "debug")]
    async fn register(&self, key: &str, value: &str) -> Result<(), RegistryError> { self.locked(key, Change::Add(value)).await }

    #[instrument(skip(self), level = "debug")]
    async fn unregister(&self, key: &str, value: &str) -> Result<(), RegistryError> { self.locked(key, Change::Remove(value)).await }

    async fn get(&self, key: &str) -> Result<BTreeSet<String>, RegistryError> { self.inner.lookup(key).await }
}
