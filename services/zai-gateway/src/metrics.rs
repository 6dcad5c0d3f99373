//! Prometheus metrics exposition
//!
//! Gateway-level metrics:
//!
//! - `gateway_requests_total` (counter): labels `status`, `mode`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_upstream_errors_total` (counter): label `error_type`
//!
//! The pool crate records `pool_selections_total`, `pool_refresh_total` and
//! `pool_invalidations_total` through the same global recorder.

use std::time::Duration;

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "gateway_request_duration_seconds";

/// Histogram buckets from 5ms to 120s; streaming completions run long.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .context("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The duration metric is configured with explicit buckets so it renders as a
/// histogram (with `_bucket` lines) rather than a summary.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a finished chat request. `mode` is `stream` or `complete`.
pub fn record_request(status: u16, mode: &'static str, duration: Duration) {
    let status_str = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status_str.clone(), "mode" => mode)
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration.as_secs_f64());
}

/// Record a failed upstream attempt by kind (`auth`, `status`, `transport`).
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("gateway_upstream_errors_total", "error_type" => error_type).increment(1);
}
