//! Prometheus metrics.
//!
//! Recording is always safe: without an installed recorder the `metrics` macros are
//! no-ops, which keeps library use and unit tests free of global setup.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder once and return its render handle.
///
/// Returns `None` if another recorder is already installed.
pub fn init() -> Option<PrometheusHandle> {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Prometheus recorder not installed: {}", e);
                None
            }
        })
        .clone()
}

/// Cache lookup outcome: `hit`, `partial` or `miss`.
pub fn record_lookup(outcome: &'static str) {
    counter!("rangecache_lookups_total", "outcome" => outcome).increment(1);
}

/// Bytes delivered to consumers, by `source` (`cache` or `network`).
pub fn record_bytes(source: &'static str, bytes: u64) {
    counter!("rangecache_bytes_delivered_total", "source" => source).increment(bytes);
}

/// A cache file removed by a sweep, by `reason` (`age`, `count`, `size`, `manual`).
pub fn record_eviction(reason: &'static str, bytes: u64) {
    counter!("rangecache_evictions_total", "reason" => reason).increment(1);
    counter!("rangecache_evicted_bytes_total", "reason" => reason).increment(bytes);
}

pub fn record_request(endpoint: &'static str, status: u16) {
    counter!(
        "rangecache_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_duration(endpoint: &'static str, start: Instant) {
    histogram!("rangecache_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

pub fn set_active_items(count: usize) {
    gauge!("rangecache_active_items").set(count as f64);
}
