use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Request metrics
    pub static ref LOCATE_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("locate_requests_total", "Total number of locate requests by mode"),
        &["mode"]
    ).unwrap();

    pub static ref CHAT_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("chat_requests_total", "Total number of chat requests by mode"),
        &["mode"]
    ).unwrap();

    // Cache metrics
    pub static ref GEO_CACHE_HITS: IntCounter = IntCounter::new(
        "geo_cache_hits_total",
        "Total number of geo context cache hits"
    ).unwrap();

    pub static ref GEO_CACHE_MISSES: IntCounter = IntCounter::new(
        "geo_cache_misses_total",
        "Total number of geo context cache misses"
    ).unwrap();

    pub static ref CACHE_EVICTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_evictions_total", "Entries removed by the periodic sweep"),
        &["cache"]
    ).unwrap();

    // Upstream metrics
    pub static ref UPSTREAM_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("upstream_failures_total", "Failed upstream calls by service and kind"),
        &["service", "kind"]
    ).unwrap();

    pub static ref GEO_BUDGET_OVERRUNS: IntCounter = IntCounter::new(
        "geo_budget_overruns_total",
        "Geo context builds that hit the total time budget"
    ).unwrap();

    pub static ref GEO_RADIUS_ESCALATIONS: IntCounter = IntCounter::new(
        "geo_radius_escalations_total",
        "POI queries re-issued at a wider radius"
    ).unwrap();

    // Model metrics
    pub static ref MODEL_CALLS: IntCounterVec = IntCounterVec::new(
        Opts::new("model_calls_total", "Model invocations by purpose"),
        &["purpose"]
    ).unwrap();

    pub static ref MODEL_REPAIRS: IntCounterVec = IntCounterVec::new(
        Opts::new("model_repairs_total", "Evidence repair invocations by outcome"),
        &["outcome"]
    ).unwrap();

    pub static ref MODEL_CONTRACT_VIOLATIONS: IntCounter = IntCounter::new(
        "model_contract_violations_total",
        "Model answers rejected by schema validation"
    ).unwrap();

    // Job metrics
    pub static ref JOBS_CREATED: IntCounter = IntCounter::new(
        "locate_jobs_created_total",
        "Total number of locate jobs created"
    ).unwrap();

    pub static ref JOBS_COMPLETED: IntCounter = IntCounter::new(
        "locate_jobs_completed_total",
        "Total number of locate jobs that reached done"
    ).unwrap();

    pub static ref JOBS_FAILED: IntCounter = IntCounter::new(
        "locate_jobs_failed_total",
        "Total number of locate jobs that reached error"
    ).unwrap();

    pub static ref JOBS_EXPIRED: IntCounter = IntCounter::new(
        "locate_jobs_expired_total",
        "Total number of locate jobs removed by the TTL sweep"
    ).unwrap();

    pub static ref JOBS_LIVE: IntGauge = IntGauge::new(
        "locate_jobs_live",
        "Current number of job records held in memory"
    ).unwrap();

    // Latency metrics (in seconds)
    pub static ref PIPELINE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "locate_pipeline_duration_seconds",
            "End-to-end locate pipeline latency in seconds"
        )
        .buckets(vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0])
    ).unwrap();

    pub static ref GEO_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "geo_context_duration_seconds",
            "Geo context build latency in seconds"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(LOCATE_REQUESTS.clone()),
        Box::new(CHAT_REQUESTS.clone()),
        Box::new(GEO_CACHE_HITS.clone()),
        Box::new(GEO_CACHE_MISSES.clone()),
        Box::new(CACHE_EVICTIONS.clone()),
        Box::new(UPSTREAM_FAILURES.clone()),
        Box::new(GEO_BUDGET_OVERRUNS.clone()),
        Box::new(GEO_RADIUS_ESCALATIONS.clone()),
        Box::new(MODEL_CALLS.clone()),
        Box::new(MODEL_REPAIRS.clone()),
        Box::new(MODEL_CONTRACT_VIOLATIONS.clone()),
        Box::new(JOBS_CREATED.clone()),
        Box::new(JOBS_COMPLETED.clone()),
        Box::new(JOBS_FAILED.clone()),
        Box::new(JOBS_EXPIRED.clone()),
        Box::new(JOBS_LIVE.clone()),
        Box::new(PIPELINE_LATENCY.clone()),
        Box::new(GEO_LATENCY.clone()),
    ];

    for collector in collectors {
        // Already registered when called twice (tests); keep the first registration
        if let Err(e) = REGISTRY.register(collector) {
            tracing::debug!("Metric registration skipped: {}", e);
        }
    }

    tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
}

/// Record a failed upstream call
pub fn record_upstream_failure(service: &str, err: &crate::error::LocateError) {
    let kind = match err {
        crate::error::LocateError::UpstreamTimeout { .. } => "timeout",
        _ => "failure",
    };
    UPSTREAM_FAILURES.with_label_values(&[service, kind]).inc();
}

/// Get geo cache hit rate as a percentage
pub fn geo_cache_hit_rate() -> f64 {
    let hits = GEO_CACHE_HITS.get() as f64;
    let misses = GEO_CACHE_MISSES.get() as f64;
    let total = hits + misses;

    if total == 0.0 {
        0.0
    } else {
        (hits / total) * 100.0
    }
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
