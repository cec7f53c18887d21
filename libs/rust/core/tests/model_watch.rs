use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use typemesh_core::model::{ExternalDefinition, ModelArtifact, ModelCache, ModelError, ModelLoader, ModelSource, ModelWatcher};

const DEBOUNCE: Duration = Duration::from_millis(200);

fn write_model(dir: &Path, n: usize) {
    let doc = format!(r#"{{"schemas":[{{"namespace":"acme.m{n}","services":["S{n}"],"entity_types":["T"]}}]}}"#);
    std::fs::write(dir.join(format!("m{n}.model.json")), doc).unwrap();
}

/// Directory loader that can be switched into failing scans.
struct Switchable { inner: ModelSource, failing: AtomicBool, scans: AtomicUsize }

#[async_trait]
impl ModelLoader for Switchable {
    async fn scan(&self) -> Result<Vec<ModelArtifact>, ModelError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) { return Err(ModelError::Worker("scan disabled".into())); }
        self.inner.scan().await
    }
    async fn load_external(&self, definition: &ExternalDefinition) -> Result<ModelArtifact, ModelError> {
        self.inner.load_external(definition).await
    }
}

async fn wait_for_scans(loader: &Switchable, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while loader.scans.load(Ordering::SeqCst) < n { tokio::time::sleep(Duration::from_millis(20)).await; }
    }).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_of_writes_reloads_once() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ModelCache::new(Arc::new(ModelSource::new(dir.path()))));
    let before = cache.get().await.unwrap();
    assert!(before.is_empty());
    let mut rx = cache.subscribe();
    let watcher = ModelWatcher::spawn(cache.clone(), dir.path().to_path_buf(), DEBOUNCE).unwrap();

    for n in 0..5 { write_model(dir.path(), n); }
    tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    tokio::time::sleep(DEBOUNCE * 3).await;
    assert!(rx.try_recv().is_err(), "burst produced more than one reload");

    let after = cache.current().unwrap();
    assert!(after.generation > before.generation);
    assert_eq!(after.len(), 5);
    watcher.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_watch_reload_keeps_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path(), 0);
    let loader = Arc::new(Switchable { inner: ModelSource::new(dir.path()), failing: AtomicBool::new(false), scans: AtomicUsize::new(0) });
    let cache = Arc::new(ModelCache::new(loader.clone()));
    let before = cache.get().await.unwrap();
    let mut rx = cache.subscribe();
    let watcher = ModelWatcher::spawn(cache.clone(), dir.path().to_path_buf(), DEBOUNCE).unwrap();

    loader.failing.store(true, Ordering::SeqCst);
    write_model(dir.path(), 1);
    wait_for_scans(&loader, 2).await;
    assert!(Arc::ptr_eq(&before, &cache.current().unwrap()));
    assert!(rx.try_recv().is_err());

    // the watcher keeps running after a failure
    loader.failing.store(false, Ordering::SeqCst);
    write_model(dir.path(), 2);
    tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    let after = cache.current().unwrap();
    assert!(after.generation > before.generation);
    assert_eq!(after.len(), 3);
    watcher.stop();
}
