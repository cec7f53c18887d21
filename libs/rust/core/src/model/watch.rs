//! Filesystem watcher that reloads the model cache when the model directory changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::ModelCache;

pub struct ModelWatcher {
    // dropping the watcher stops event delivery
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ModelWatcher {
    /// Starts watching `dir`; bursts of events within `debounce` collapse into one reload.
    pub fn spawn(cache: Arc<ModelCache>, dir: PathBuf, debounce: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel(64);
        let mut watcher = RecommendedWatcher::new(move |res: notify::Result<notify::Event>| {
            if let Ok(ev) = res {
                if matches!(ev.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) { let _ = tx.blocking_send(()); }
            }
        }, notify::Config::default())?;
        watcher.watch(&dir, RecursiveMode::Recursive)?;
        info!(dir = %dir.display(), "model_watch_started");
        let task = tokio::spawn(watch_loop(cache, rx, debounce));
        Ok(Self { _watcher: watcher, task })
    }

    pub fn stop(self) { self.task.abort(); }
}

async fn watch_loop(cache: Arc<ModelCache>, mut rx: mpsc::Receiver<()>, debounce: Duration) {
    while rx.recv().await.is_some() {
        // drain the burst
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        debug!("model_dir_changed");
        if let Err(e) = cache.reload().await { warn!(error = %e, "watch_reload_failed_keeping_previous_models"); }
    }
}
