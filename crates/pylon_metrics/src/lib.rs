//! Proxy metrics sink.
//!
//! One `ProxyMetrics` owns a private Prometheus registry and exposes
//! typed recording methods, so the engine and pool never touch metric
//! families directly. The instance is passed down explicitly as an
//! `Arc`; there is no global registry.

mod server;

pub use server::serve;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use tracing::error;

/// Bucket edges (seconds) shared by both latency histograms.
pub const LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0];

pub struct ProxyMetrics {
    registry: Registry,
    upstream_errors: IntCounterVec,
    pool_errors: IntCounter,
    request_latency: HistogramVec,
    pool_latency: Histogram,
}

impl ProxyMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let upstream_errors = IntCounterVec::new(
            Opts::new("proxy_upstream_errors_total", "Upstream timeouts"),
            &["upstream"],
        )?;
        let pool_errors = IntCounter::new("proxy_pool_errors_total", "Pool timeouts")?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new("proxy_request_latency_seconds", "HTTP request latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["upstream"],
        )?;
        let pool_latency = Histogram::with_opts(
            HistogramOpts::new("pool_latency_seconds", "Wait to acquire a pool member")
                .buckets(LATENCY_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(upstream_errors.clone()))?;
        registry.register(Box::new(pool_errors.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(pool_latency.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            upstream_errors,
            pool_errors,
            request_latency,
            pool_latency,
        })
    }

    pub fn inc_upstream_error(&self, upstream: &str) {
        self.upstream_errors.with_label_values(&[upstream]).inc();
    }

    pub fn inc_pool_error(&self) {
        self.pool_errors.inc();
    }

    /// End-to-end proxy latency for one request/response exchange.
    pub fn observe_request_latency(&self, upstream: &str, seconds: f64) {
        self.request_latency
            .with_label_values(&[upstream])
            .observe(seconds);
    }

    /// Time spent waiting to take a connection out of the pool.
    pub fn observe_pool_wait(&self, seconds: f64) {
        self.pool_latency.observe(seconds);
    }

    pub fn upstream_errors(&self, upstream: &str) -> u64 {
        self.upstream_errors.with_label_values(&[upstream]).get()
    }

    pub fn pool_errors(&self) -> u64 {
        self.pool_errors.get()
    }

    pub fn request_latency_count(&self, upstream: &str) -> u64 {
        self.request_latency
            .with_label_values(&[upstream])
            .get_sample_count()
    }

    /// Encode the whole registry in the Prometheus text format.
    pub fn render(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            error!(target: "pylon::metrics", error = ?err, "Failed to encode metrics");
        }
        buf
    }
}
