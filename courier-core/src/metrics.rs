//! Prometheus metrics for the inter-service runtime
//!
//! Collectors live in a dedicated registry so embedding applications can
//! merge `gather_metrics()` output into their own `/metrics` endpoint.

use prometheus::{
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, CounterVec, Encoder,
    HistogramVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// RPC collectors, labelled by target service
pub mod rpc {
    use super::{
        register_counter_vec_with_registry, register_histogram_vec_with_registry,
        register_int_gauge_vec_with_registry, CounterVec, HistogramVec, IntGaugeVec, REGISTRY,
    };

    /// Finished requests by outcome ("success" or the terminal error code)
    pub static RPC_REQUESTS_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "courier_rpc_requests_total",
            "Total number of inter-service requests",
            &["target", "outcome"],
            REGISTRY.clone()
        )
        .expect("Failed to register RPC_REQUESTS_TOTAL")
    });

    pub static RPC_RETRIES_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "courier_rpc_retries_total",
            "Total number of retried request attempts",
            &["target"],
            REGISTRY.clone()
        )
        .expect("Failed to register RPC_RETRIES_TOTAL")
    });

    pub static RPC_REQUEST_DURATION: std::sync::LazyLock<HistogramVec> = std::sync::LazyLock::new(|| {
        register_histogram_vec_with_registry!(
            "courier_rpc_request_duration_seconds",
            "Inter-service request duration in seconds, retries included",
            &["target"],
            REGISTRY.clone()
        )
        .expect("Failed to register RPC_REQUEST_DURATION")
    });

    /// 0 = closed, 1 = half-open, 2 = open
    pub static CIRCUIT_BREAKER_STATE: std::sync::LazyLock<IntGaugeVec> = std::sync::LazyLock::new(|| {
        register_int_gauge_vec_with_registry!(
            "courier_circuit_breaker_state",
            "Circuit breaker state per target service",
            &["target"],
            REGISTRY.clone()
        )
        .expect("Failed to register CIRCUIT_BREAKER_STATE")
    });
}

/// Registry and health collectors
pub mod discovery {
    use super::{
        register_counter_vec_with_registry, register_int_gauge_with_registry, CounterVec, IntGauge,
        REGISTRY,
    };

    pub static REGISTERED_SERVICES: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "courier_registered_services",
            "Number of registrations held in the registry cache",
            REGISTRY.clone()
        )
        .expect("Failed to register REGISTERED_SERVICES")
    });

    pub static HEALTH_CHECKS_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "courier_health_checks_total",
            "Completed health checks by verdict",
            &["outcome"],
            REGISTRY.clone()
        )
        .expect("Failed to register HEALTH_CHECKS_TOTAL")
    });
}

/// Render every registered collector in the Prometheus text format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
