use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use typemesh_core::model::{ModelCache, ModelSource, ModelWatcher};
use typemesh_core::registry::{CapabilityDirectory, CapabilityRegistry, ProviderAnnouncer, WriteLockRegistry};
use typemesh_core::router::{Consolidator, Router};
use typemesh_core::{clear_ready, init_metrics, init_tracing, load_config, start_health_server, BootstrapState, GatewayConfig};
use typemesh_gateway::{build_provider, expand_types, local_subject, serve_provider, serve_queries, Delivery, NatsClusterMap, NatsDispatcher, NatsLockManager};

const SERVICE: &str = "typemesh-gateway";
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);
const WATCH_DEBOUNCE: Duration = Duration::from_millis(250);

struct Hosted { announcer: ProviderAnnouncer, patterns: Vec<String> }

async fn announce_all(hosted: &[Hosted], cache: &ModelCache) {
    let snapshot = cache.current();
    for h in hosted {
        let types = expand_types(&h.patterns, snapshot.as_deref());
        if let Err(e) = h.announcer.announce(types).await {
            warn!(address = %h.announcer.address(), error = %e, "provider_announce_failed");
        }
    }
}

fn open_directory(cfg: &GatewayConfig, map: NatsClusterMap, locks: NatsLockManager) -> Arc<dyn CapabilityDirectory> {
    match cfg.lock_deadline() {
        Some(deadline) => {
            info!(deadline_ms = deadline.as_millis() as u64, scope = ?cfg.lock_scope, "registry_expiring_locks");
            Arc::new(WriteLockRegistry::new(Arc::new(map), Arc::new(locks), cfg.lock_scope, deadline))
        }
        None => Arc::new(CapabilityRegistry::new(Arc::new(map), Arc::new(locks), cfg.lock_scope)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(SERVICE)?;
    init_metrics()?;
    let cfg = load_config(SERVICE)?;
    start_health_server(cfg.health_port).await?;
    let mut boot = BootstrapState::new();
    info!(node_id = %cfg.node_id, nats_url = %cfg.nats_url, "gateway_starting");

    let client = async_nats::connect(cfg.nats_url.as_str()).await?;
    let js = async_nats::jetstream::new(client.clone());
    let map = NatsClusterMap::open(&js, &cfg.registry_bucket).await?;
    let locks = NatsLockManager::open(&js, &cfg.lock_bucket, &cfg.node_id).await?;
    let directory = open_directory(&cfg, map, locks);
    boot.advance();

    let cache = Arc::new(ModelCache::new(Arc::new(ModelSource::new(&cfg.model_dir))));
    let snapshot = cache.get().await?;
    info!(namespaces = snapshot.len(), generation = snapshot.generation, "models_ready");
    let watcher = if cfg.watch_models {
        ModelWatcher::spawn(cache.clone(), cfg.model_dir.clone().into(), WATCH_DEBOUNCE)
            .map_err(|e| warn!(error = %e, dir = %cfg.model_dir, "model_watch_unavailable"))
            .ok()
    } else { None };
    boot.advance();

    let dispatcher = Arc::new(NatsDispatcher::new(client.clone(), cfg.node_id.clone(), DISPATCH_TIMEOUT));
    let mut tasks = Vec::new();
    let consolidator = Arc::new(Consolidator::new(directory.clone(), dispatcher.clone(), cfg.merge_policy()));
    tasks.push(serve_provider(client.clone(), local_subject(&cfg.consolidator_address, &cfg.node_id), Delivery::Direct, consolidator).await?);

    let mut hosted = Vec::with_capacity(cfg.providers.len());
    for p in &cfg.providers {
        let (kind, handler) = build_provider(p)?;
        tasks.push(serve_provider(client.clone(), p.address.clone(), Delivery::Queue(p.address.clone()), handler).await?);
        info!(address = %p.address, ?kind, "provider_hosted");
        hosted.push(Hosted { announcer: ProviderAnnouncer::new(directory.clone(), p.address.clone()), patterns: p.types.clone() });
    }
    let hosted = Arc::new(hosted);
    announce_all(&hosted, &cache).await;

    let router = Arc::new(Router::new(directory.clone(), dispatcher).with_consolidator_address(cfg.consolidator_address.clone()));
    tasks.push(serve_queries(client.clone(), cfg.query_subject.clone(), router).await?);

    // registry entries never expire; keep ours fresh and follow model changes
    let reannounce = {
        let (hosted, cache) = (hosted.clone(), cache.clone());
        let mut changes = cache.subscribe();
        let mut interval = tokio::time::interval(cfg.reannounce_interval());
        interval.tick().await;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = changes.recv() => match changed {
                        Ok(_) | Err(RecvError::Lagged(_)) => info!("models_changed_reannouncing"),
                        Err(RecvError::Closed) => break,
                    },
                }
                announce_all(&hosted, &cache).await;
            }
        })
    };
    boot.advance();
    info!(phases = ?boot.durations(), total_ms = boot.total().as_millis() as u64, "gateway_operational");

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    clear_ready();
    reannounce.abort();
    for h in hosted.iter() { h.announcer.withdraw().await; }
    for t in tasks { t.abort(); }
    if let Some(w) = watcher { w.stop(); }
    client.flush().await?;
    Ok(())
}
