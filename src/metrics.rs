use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub endpoint: String,
    pub method: String,
    pub status: u32,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TierLabels {
    pub tier: CacheTier,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheTier {
    Memory,
    Disk,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- http --
    pub http_requests: Family<RequestLabels, Counter>,
    pub http_request_duration_seconds: Family<EndpointLabels, Histogram>,

    // -- cache --
    pub cache_hits: Family<TierLabels, Counter>,
    pub cache_misses: Counter,

    // -- rate limiting --
    pub rate_limited: Counter,

    // -- auth --
    pub auth_cache_hits: Counter,
    pub auth_cache_misses: Counter,
    pub auth_failures: Counter,

    // -- upstream --
    pub upstream_requests: Counter,
    pub upstream_errors: Counter,

    // -- ssh --
    pub ssh_sessions: Counter,
    pub ssh_active_sessions: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let http_requests = Family::<RequestLabels, Counter>::default();
        registry.register(
            "hubproxy_http_requests",
            "Proxied HTTP requests by endpoint, method and status",
            http_requests.clone(),
        );

        let http_request_duration_seconds =
            Family::<EndpointLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            });
        registry.register(
            "hubproxy_http_request_duration_seconds",
            "HTTP request latency in seconds",
            http_request_duration_seconds.clone(),
        );

        let cache_hits = Family::<TierLabels, Counter>::default();
        registry.register(
            "hubproxy_cache_hits",
            "Cache hits by tier",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        registry.register("hubproxy_cache_misses", "Cache misses", cache_misses.clone());

        let rate_limited = Counter::default();
        registry.register(
            "hubproxy_rate_limited",
            "Requests rejected by the rate limiter",
            rate_limited.clone(),
        );

        let auth_cache_hits = Counter::default();
        registry.register(
            "hubproxy_auth_cache_hits",
            "Auth verdict cache hits",
            auth_cache_hits.clone(),
        );

        let auth_cache_misses = Counter::default();
        registry.register(
            "hubproxy_auth_cache_misses",
            "Auth verdict cache misses",
            auth_cache_misses.clone(),
        );

        let auth_failures = Counter::default();
        registry.register(
            "hubproxy_auth_failures",
            "Rejected authentication attempts",
            auth_failures.clone(),
        );

        let upstream_requests = Counter::default();
        registry.register(
            "hubproxy_upstream_requests",
            "Requests issued to the origin",
            upstream_requests.clone(),
        );

        let upstream_errors = Counter::default();
        registry.register(
            "hubproxy_upstream_errors",
            "Origin transport failures",
            upstream_errors.clone(),
        );

        let ssh_sessions = Counter::default();
        registry.register(
            "hubproxy_ssh_sessions",
            "Accepted SSH sessions",
            ssh_sessions.clone(),
        );

        let ssh_active_sessions: Gauge = Gauge::default();
        registry.register(
            "hubproxy_ssh_active_sessions",
            "Currently active SSH sessions",
            ssh_active_sessions.clone(),
        );

        Self {
            http_requests,
            http_request_duration_seconds,
            cache_hits,
            cache_misses,
            rate_limited,
            auth_cache_hits,
            auth_cache_misses,
            auth_failures,
            upstream_requests,
            upstream_errors,
            ssh_sessions,
            ssh_active_sessions,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_encodes_registered_metrics() {
        let registry = MetricsRegistry::new();
        registry.metrics.cache_misses.inc();
        registry.metrics.cache_hits.get_or_create(&TierLabels { tier: CacheTier::Memory }).inc();

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &registry.registry).unwrap();
        assert!(out.contains("hubproxy_cache_misses_total 1"));
        assert!(out.contains("tier=\"Memory\""));
    }
}
