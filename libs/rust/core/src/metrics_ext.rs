//! Metric groups for the model cache, registry, router and batch coordinator.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub struct ModelMetrics {
    pub reloads_total: Counter<u64>,
    pub reload_failures_total: Counter<u64>,
    pub reload_latency_ms: Histogram<f64>,
}

pub struct RegistryMetrics {
    pub mutations_total: Counter<u64>,
    pub lock_timeouts_total: Counter<u64>,
}

pub struct RouterMetrics {
    pub requests_total: Counter<u64>,
    pub failures_total: Counter<u64>,
}

pub struct BatchMetrics {
    pub parts_total: Counter<u64>,
}

pub struct CoreMetrics {
    pub model: ModelMetrics,
    pub registry: RegistryMetrics,
    pub router: RouterMetrics,
    pub batch: BatchMetrics,
}

static CORE_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("typemesh_core"));

pub static CORE_METRICS: Lazy<CoreMetrics> = Lazy::new(|| {
    CoreMetrics {
        model: ModelMetrics {
            reloads_total: CORE_METER.u64_counter("typemesh_model_reloads_total").with_description("Model snapshots installed").build(),
            reload_failures_total: CORE_METER.u64_counter("typemesh_model_reload_failures_total").with_description("Reloads that kept the previous snapshot").build(),
            reload_latency_ms: CORE_METER.f64_histogram("typemesh_model_reload_latency_ms").with_description("Scan + parse + install latency ms").with_unit("ms").build(),
        },
        registry: RegistryMetrics {
            mutations_total: CORE_METER.u64_counter("typemesh_registry_mutations_total").with_description("Register/unregister attempts by outcome").build(),
            lock_timeouts_total: CORE_METER.u64_counter("typemesh_registry_lock_timeouts_total").with_description("Write locks force-released at their deadline").build(),
        },
        router: RouterMetrics {
            requests_total: CORE_METER.u64_counter("typemesh_router_requests_total").with_description("Routed requests by provider arity").build(),
            failures_total: CORE_METER.u64_counter("typemesh_router_failures_total").with_description("Routed requests that failed").build(),
        },
        batch: BatchMetrics {
            parts_total: CORE_METER.u64_counter("typemesh_batch_parts_total").with_description("Child handles registered on batch frames").build(),
        },
    }
});
