//! Shared model snapshot with single-flight loading.
//!
//! Readers take the current `Arc<ModelSnapshot>` without locking. Loads and
//! reloads serialize on one async mutex, so concurrent first callers trigger a
//! single scan and nobody observes a half-built snapshot.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use super::artifact::{ExternalDefinition, ModelArtifact, ModelSnapshot};
use super::source::ModelLoader;
use super::ModelError;
use crate::metrics_ext::CORE_METRICS;

/// Local-only signal fired after every successful reload. Carries no data:
/// subscribers re-read [`ModelCache::current`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelsChanged;

pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    current: ArcSwapOption<ModelSnapshot>,
    load_lock: Mutex<()>,
    externals: RwLock<HashSet<Arc<ExternalDefinition>>>,
    generation: AtomicU64,
    changed: broadcast::Sender<ModelsChanged>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        let (changed, _) = broadcast::channel(16);
        Self { loader, current: ArcSwapOption::empty(), load_lock: Mutex::new(()), externals: RwLock::new(HashSet::new()), generation: AtomicU64::new(0), changed }
    }

    /// Snapshot currently installed, if any load has succeeded.
    pub fn current(&self) -> Option<Arc<ModelSnapshot>> { self.current.load_full() }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelsChanged> { self.changed.subscribe() }

    pub fn external_count(&self) -> usize { self.externals.read().len() }

    /// Cached snapshot, loading it first if nothing is installed yet.
    pub async fn get(&self) -> Result<Arc<ModelSnapshot>, ModelError> {
        if let Some(snapshot) = self.current.load_full() { return Ok(snapshot); }
        let _guard = self.load_lock.lock().await;
        // another caller may have finished the load while we waited
        if let Some(snapshot) = self.current.load_full() { return Ok(snapshot); }
        self.reload_locked().await
    }

    /// Re-reads every source and swaps in a fresh snapshot.
    pub async fn reload(&self) -> Result<Arc<ModelSnapshot>, ModelError> {
        let _guard = self.load_lock.lock().await;
        self.reload_locked().await
    }

    pub async fn register_external(&self, definition: ExternalDefinition) -> Result<Arc<ModelSnapshot>, ModelError> {
        let definition = Arc::new(definition);
        let added = self.externals.write().insert(definition.clone());
        if !added { return self.get().await; }
        info!(name = %definition.name, "external_model_registered");
        match self.reload().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                // a definition that cannot load would fail every later reload
                self.externals.write().remove(&definition);
                Err(e)
            }
        }
    }

    pub async fn unregister_external(&self, definition: &ExternalDefinition) -> Result<Arc<ModelSnapshot>, ModelError> {
        let removed = self.externals.write().remove(definition);
        if !removed { return self.get().await; }
        info!(name = %definition.name, "external_model_unregistered");
        self.reload().await
    }

    async fn reload_locked(&self) -> Result<Arc<ModelSnapshot>, ModelError> {
        let started = Instant::now();
        match self.build_snapshot().await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.current.store(Some(snapshot.clone()));
                CORE_METRICS.model.reloads_total.add(1, &[]);
                CORE_METRICS.model.reload_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
                info!(generation = snapshot.generation, namespaces = snapshot.len(), "models_reloaded");
                // no receivers is fine
                let _ = self.changed.send(ModelsChanged);
                Ok(snapshot)
            }
            Err(e) => {
                CORE_METRICS.model.reload_failures_total.add(1, &[]);
                warn!(error = %e, "model_reload_failed");
                Err(e)
            }
        }
    }

    async fn build_snapshot(&self) -> Result<ModelSnapshot, ModelError> {
        let mut artifacts: BTreeMap<String, Arc<ModelArtifact>> = BTreeMap::new();
        for artifact in self.loader.scan().await? {
            if artifacts.contains_key(&artifact.namespace) {
                warn!(namespace = %artifact.namespace, origin = %artifact.origin, "duplicate_namespace_ignored");
                continue;
            }
            artifacts.insert(artifact.namespace.clone(), Arc::new(artifact));
        }
        let mut externals: Vec<Arc<ExternalDefinition>> = self.externals.read().iter().cloned().collect();
        externals.sort_by(|a, b| a.name.cmp(&b.name));
        for definition in externals {
            let artifact = self.loader.load_external(&definition).await?;
            if artifacts.contains_key(&artifact.namespace) {
                warn!(namespace = %artifact.namespace, name = %definition.name, "external_model_overrides_namespace");
            }
            artifacts.insert(artifact.namespace.clone(), Arc::new(artifact));
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ModelSnapshot { generation, artifacts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use crate::model::artifact::parse_artifact;

    struct Fixed { scans: AtomicUsize, docs: Vec<(&'static str, &'static str)> }

    #[async_trait]
    impl ModelLoader for Fixed {
        async fn scan(&self) -> Result<Vec<ModelArtifact>, ModelError> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            self.docs.iter().map(|(origin, doc)| parse_artifact(origin, Bytes::from_static(doc.as_bytes()), &Default::default())).collect()
        }
        async fn load_external(&self, definition: &ExternalDefinition) -> Result<ModelArtifact, ModelError> {
            parse_artifact(&definition.name, definition.primary.clone(), &Default::default())
        }
    }

    const SALES: &str = r#"{"schemas":[{"namespace":"acme.sales","services":["SalesService"]}]}"#;

    fn cache() -> (Arc<Fixed>, ModelCache) {
        let loader = Arc::new(Fixed { scans: AtomicUsize::new(0), docs: vec![("sales.model.json", SALES)] });
        let cache = ModelCache::new(loader.clone());
        (loader, cache)
    }

    #[tokio::test]
    async fn get_loads_once_then_serves_cache() {
        let (loader, cache) = cache();
        let a = cache.get().await.unwrap();
        let b = cache.get().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loader.scans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reload_bumps_generation_and_notifies() {
        let (_, cache) = cache();
        let mut rx = cache.subscribe();
        let first = cache.reload().await.unwrap();
        let second = cache.reload().await.unwrap();
        assert!(second.generation > first.generation);
        assert!(first.same_content(&second));
        assert_eq!(rx.recv().await.unwrap(), ModelsChanged);
    }

    #[tokio::test]
    async fn duplicate_registration_does_not_reload() {
        let (loader, cache) = cache();
        let def = ExternalDefinition::new("hr.model.json", br#"{"schemas":[{"namespace":"acme.hr","services":["HrService"]}]}"#.to_vec());
        let snap = cache.register_external(def.clone()).await.unwrap();
        assert!(snap.get("acme.hr").is_some());
        let scans = loader.scans.load(Ordering::SeqCst);
        cache.register_external(def.clone()).await.unwrap();
        assert_eq!(loader.scans.load(Ordering::SeqCst), scans);
        let snap = cache.unregister_external(&def).await.unwrap();
        assert!(snap.get("acme.hr").is_none());
        assert_eq!(cache.external_count(), 0);
    }

    #[tokio::test]
    async fn failed_registration_keeps_previous_snapshot() {
        let (_, cache) = cache();
        let before = cache.get().await.unwrap();
        let bad = ExternalDefinition::new("bad.model.json", br#"{"schemas":[{"namespace":"x"}]}"#.to_vec());
        assert!(matches!(cache.register_external(bad).await, Err(ModelError::NoNamespace { .. })));
        assert!(Arc::ptr_eq(&before, &cache.current().unwrap()));
        assert_eq!(cache.external_count(), 0);
        assert!(cache.reload().await.is_ok());
    }
}
