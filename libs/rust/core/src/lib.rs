//! Core runtime for typemesh query gateways: model cache, capability registry,
//! routing and batch coordination, plus shared telemetry helpers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use anyhow::Result;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router as HttpRouter};
use once_cell::sync::OnceCell;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, TextEncoder};
use tracing::info;
use tracing_subscriber::prelude::*;

pub mod batch;
pub mod config;
pub mod lifecycle;
pub mod metrics_ext;
pub mod model;
pub mod registry;
pub mod router;

pub use batch::{settle, BatchContext, BatchError, BatchFailure, BatchState, CallSite, CompletionHandle};
pub use config::{load_config, GatewayConfig, ProviderConfig};
pub use lifecycle::{BootstrapPhase, BootstrapState};
pub use metrics_ext::{CoreMetrics, CORE_METRICS};
pub use model::{EmbeddedResources, ExternalDefinition, ModelArtifact, ModelCache, ModelError, ModelLoader, ModelSnapshot, ModelSource, ModelWatcher, ModelsChanged};
pub use registry::{CapabilityDirectory, CapabilityRegistry, ClusterMap, LockManager, LockScope, ProviderAnnouncer, RegistryError, WriteLockRegistry};
pub use router::{Consolidator, Dispatcher, Envelope, MergePolicy, Provider, QueryRequest, QueryResponse, Reply, RouteError, Router};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static PROM_REGISTRY: OnceCell<prometheus::Registry> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }
pub fn is_live() -> bool { NODE_LIVENESS.load(Ordering::SeqCst) }

/// Installs the global subscriber once. `RUST_LOG` filters (default `info`);
/// `TYPEMESH_JSON_LOG=1` switches to flattened JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("TYPEMESH_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true));
        let json_layer = json.then(|| tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false));
        tracing_subscriber::registry().with(env_filter).with(text_layer).with(json_layer).try_init()?;
        Ok(())
    })?;
    info!(%service, "tracing_initialized");
    Ok(())
}

/// Routes the global meter provider into a Prometheus registry served on
/// `/metrics`. Call before the first metric is touched.
pub fn init_metrics() -> Result<()> {
    PROM_REGISTRY.get_or_try_init(|| -> Result<prometheus::Registry> {
        let registry = prometheus::Registry::new();
        let exporter = opentelemetry_prometheus::exporter().with_registry(registry.clone()).build()?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        opentelemetry::global::set_meter_provider(provider);
        Ok(registry)
    })?;
    Ok(())
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let app = HttpRouter::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": is_live()})) }))
        .route("/ready", get(|| async { axum::Json(serde_json::json!({"ready": is_ready()})) }))
        .route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(?addr, "health_server_listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "health_server_failed");
        }
    });
    Ok(())
}

async fn metrics_handler() -> Response {
    let Some(registry) = PROM_REGISTRY.get() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response();
    };
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}
