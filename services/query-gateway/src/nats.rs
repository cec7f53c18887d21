//! NATS-backed registry storage, registry locks and dispatch.
//!
//! The registry map and the lock table are JetStream key-value buckets. A lock
//! is a key created with `create` (fails while the key exists) and deleted on
//! release. Dispatch is plain request/reply carrying JSON envelopes.

use std::time::Duration;
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;
use typemesh_core::registry::{ClusterMap, HeldLock, LockManager, RegistryError};
use typemesh_core::router::{Dispatcher, Envelope, Reply, RouteError};

const LOCK_POLL_MIN: Duration = Duration::from_millis(5);
const LOCK_POLL_MAX: Duration = Duration::from_millis(200);
/// Upper bound on how long a crashed node can keep a lock key alive.
const LOCK_MAX_AGE: Duration = Duration::from_secs(30);

/// Subject a node-local service listens on: `<address>.<node_id>`.
pub fn local_subject(address: &str, node_id: &str) -> String { format!("{address}.{node_id}") }

/// Outcome carried in a reply payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireResult<T> {
    Ok(T),
    Err(String),
}

impl<T> WireResult<T> {
    pub fn from_result<E: std::fmt::Display>(r: Result<T, E>) -> Self {
        match r { Ok(v) => WireResult::Ok(v), Err(e) => WireResult::Err(e.to_string()) }
    }
}

fn backend<E: std::fmt::Display>(e: E) -> RegistryError { RegistryError::Backend(e.to_string()) }

async fn open_bucket(js: &jetstream::Context, config: kv::Config) -> anyhow::Result<kv::Store> {
    match js.get_key_value(config.bucket.clone()).await {
        Ok(store) => Ok(store),
        Err(_) => {
            debug!(bucket = %config.bucket, "kv_bucket_created");
            Ok(js.create_key_value(config).await?)
        }
    }
}

/// Registry entries as JSON arrays in a KV bucket.
#[derive(Clone)]
pub struct NatsClusterMap { store: kv::Store }

impl NatsClusterMap {
    pub async fn open(js: &jetstream::Context, bucket: &str) -> anyhow::Result<Self> {
        let store = open_bucket(js, kv::Config { bucket: bucket.to_string(), history: 1, ..Default::default() }).await?;
        Ok(Self { store })
    }
}

#[async_trait]
impl ClusterMap for NatsClusterMap {
    async fn get(&self, key: &str) -> Result<Option<Vec<String>>, RegistryError> {
        match self.store.get(key).await.map_err(backend)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, values: Vec<String>) -> Result<(), RegistryError> {
        let raw = serde_json::to_vec(&values)?;
        self.store.put(key, Bytes::from(raw)).await.map_err(backend)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), RegistryError> {
        self.store.delete(key).await.map_err(backend)
    }
}

/// Cluster-wide named locks over a KV bucket.
#[derive(Clone)]
pub struct NatsLockManager { store: kv::Store, owner: String }

impl NatsLockManager {
    pub async fn open(js: &jetstream::Context, bucket: &str, owner: &str) -> anyhow::Result<Self> {
        let config = kv::Config { bucket: bucket.to_string(), history: 1, max_age: LOCK_MAX_AGE, ..Default::default() };
        Ok(Self { store: open_bucket(js, config).await?, owner: owner.to_string() })
    }
}

struct NatsLock { store: kv::Store, name: String }

#[async_trait]
impl HeldLock for NatsLock {
    async fn release(&self) -> Result<(), RegistryError> { self.store.delete(&self.name).await.map_err(backend) }
}

#[async_trait]
impl LockManager for NatsLockManager {
    async fn acquire(&self, name: &str) -> Result<Box<dyn HeldLock>, RegistryError> {
        let mut wait = LOCK_POLL_MIN;
        loop {
            match self.store.create(name, Bytes::from(self.owner.clone())).await {
                Ok(_) => return Ok(Box::new(NatsLock { store: self.store.clone(), name: name.to_string() })),
                Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {
                    tokio::time::sleep(wait).await;
                    wait = (wait * 2).min(LOCK_POLL_MAX);
                }
                Err(e) => return Err(backend(e)),
            }
        }
    }
}

/// Request/reply dispatcher; local-only envelopes go to `<address>.<node_id>`.
#[derive(Clone)]
pub struct NatsDispatcher {
    client: async_nats::Client,
    node_id: String,
    timeout: Duration,
}

impl NatsDispatcher {
    pub fn new(client: async_nats::Client, node_id: impl Into<String>, timeout: Duration) -> Self {
        Self { client, node_id: node_id.into(), timeout }
    }

    pub fn subject_for(&self, address: &str, envelope: &Envelope) -> String {
        if envelope.local_only { local_subject(address, &self.node_id) } else { address.to_string() }
    }
}

#[async_trait]
impl Dispatcher for NatsDispatcher {
    async fn dispatch(&self, address: &str, envelope: Envelope) -> Result<Reply, RouteError> {
        let fail = |reason: String| RouteError::Dispatch { address: address.to_string(), reason };
        let subject = self.subject_for(address, &envelope);
        let body = serde_json::to_vec(&envelope).map_err(|e| fail(e.to_string()))?;
        let msg = tokio::time::timeout(self.timeout, self.client.request(subject, Bytes::from(body)))
            .await
            .map_err(|_| fail(format!("no reply within {:?}", self.timeout)))?
            .map_err(|e| fail(e.to_string()))?;
        match serde_json::from_slice::<WireResult<Reply>>(&msg.payload).map_err(|e| fail(e.to_string()))? {
            WireResult::Ok(reply) => Ok(reply),
            WireResult::Err(reason) => Err(fail(reason)),
        }
    }
}
