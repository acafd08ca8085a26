//! Prometheus metrics exposition
//!
//! Proxy metrics recorded here:
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//!
//! The key pool records its own `key_pool_*` series through the same
//! recorder; `key_pool_acquire_wait_seconds` gets buckets here.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Request latency buckets, 5ms to 60s (the proxy's timeout range).
const REQUEST_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Key wait buckets, from an immediate pick up to a full rate-limit cooldown.
const ACQUIRE_WAIT_BUCKETS: &[f64] = &[0.001, 0.01, 0.1, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0];

/// In-process counters for the health endpoint and drain logging.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub started_at: Instant,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }
}

fn builder() -> anyhow::Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            REQUEST_BUCKETS,
        )
        .context("failed to set request duration buckets")?
        .set_buckets_for_metric(
            Matcher::Full("key_pool_acquire_wait_seconds".to_string()),
            ACQUIRE_WAIT_BUCKETS,
        )
        .context("failed to set key wait buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Histograms get explicit buckets so they render with `_bucket` lines
/// (usable with `histogram_quantile()`) instead of as summaries.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}
