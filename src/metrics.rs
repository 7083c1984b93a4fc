/// Per-request metric events and the Prometheus sink
use anyhow::Result;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use std::time::Duration;

/// Label used for requests that matched no route
pub const UNMATCHED_ROUTE: &str = "unmatched";

pub const TAG_RATELIMIT_STORE: &str = "ratelimit_store";
pub const TAG_CACHE_STORE: &str = "cache_store";
pub const TAG_BACKEND_ERROR: &str = "backend_error";
pub const TAG_ERROR: &str = "error";

/// One completed request, emitted exactly once per request
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    /// Matched route name, `None` on a route miss
    pub route: Option<String>,
    pub status: u16,
    pub latency: Duration,
    pub cache_hit: bool,
    pub rate_limited: bool,
    /// Backend target that served the request
    pub backend: Option<String>,
    pub tags: Vec<(String, String)>,
}

impl MetricEvent {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn route_label(&self) -> &str {
        self.route.as_deref().unwrap_or(UNMATCHED_ROUTE)
    }
}

/// Group status codes to keep label cardinality low
pub fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

/// Destination for metric events. Failures are logged by the caller and
/// never affect the request.
pub trait MetricSink: Send + Sync {
    fn emit(&self, event: &MetricEvent) -> Result<()>;
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn emit(&self, _event: &MetricEvent) -> Result<()> {
        Ok(())
    }
}

/// Metrics collector for the gateway
pub struct PrometheusMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    cache_hits_total: IntCounterVec,
    rate_limited_total: IntCounterVec,
    ratelimit_degraded_total: IntCounterVec,
    cache_store_errors_total: IntCounterVec,
    route_misses_total: IntCounter,
    backend_errors_total: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "prism_requests_total",
                "Total number of requests by route and status class",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "prism_request_duration_seconds",
                "End-to-end request duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["route"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let cache_hits_total = IntCounterVec::new(
            Opts::new("prism_cache_hits_total", "Responses served from cache"),
            &["route"],
        )?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let rate_limited_total = IntCounterVec::new(
            Opts::new("prism_rate_limited_total", "Requests rejected by rate limiting"),
            &["route"],
        )?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        let ratelimit_degraded_total = IntCounterVec::new(
            Opts::new(
                "prism_ratelimit_degraded_total",
                "Rate limit decisions taken by the local fallback counter",
            ),
            &["route"],
        )?;
        registry.register(Box::new(ratelimit_degraded_total.clone()))?;

        let cache_store_errors_total = IntCounterVec::new(
            Opts::new(
                "prism_cache_store_errors_total",
                "Cache store operations that failed or timed out",
            ),
            &["route"],
        )?;
        registry.register(Box::new(cache_store_errors_total.clone()))?;

        let route_misses_total = IntCounter::with_opts(Opts::new(
            "prism_route_misses_total",
            "Requests that matched no route",
        ))?;
        registry.register(Box::new(route_misses_total.clone()))?;

        let backend_errors_total = IntCounterVec::new(
            Opts::new("prism_backend_errors_total", "Failed backend calls by kind"),
            &["route", "kind"],
        )?;
        registry.register(Box::new(backend_errors_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            cache_hits_total,
            rate_limited_total,
            ratelimit_degraded_total,
            cache_store_errors_total,
            route_misses_total,
            backend_errors_total,
        })
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl MetricSink for PrometheusMetrics {
    fn emit(&self, event: &MetricEvent) -> Result<()> {
        let route = event.route_label();

        self.requests_total
            .get_metric_with_label_values(&[route, status_class(event.status)])?
            .inc();
        self.request_duration
            .get_metric_with_label_values(&[route])?
            .observe(event.latency.as_secs_f64());

        if event.route.is_none() {
            self.route_misses_total.inc();
        }
        if event.cache_hit {
            self.cache_hits_total
                .get_metric_with_label_values(&[route])?
                .inc();
        }
        if event.rate_limited {
            self.rate_limited_total
                .get_metric_with_label_values(&[route])?
                .inc();
        }
        if event.tag(TAG_RATELIMIT_STORE) == Some("degraded") {
            self.ratelimit_degraded_total
                .get_metric_with_label_values(&[route])?
                .inc();
        }
        if event.tag(TAG_CACHE_STORE) == Some("unavailable") {
            self.cache_store_errors_total
                .get_metric_with_label_values(&[route])?
                .inc();
        }
        if let Some(kind) = event.tag(TAG_BACKEND_ERROR) {
            self.backend_errors_total
                .get_metric_with_label_values(&[route, kind])?
                .inc();
        }

        Ok(())
    }
}
