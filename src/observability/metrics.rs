//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_rate_limited_total` (counter): rejections by scope
//! - `gateway_rate_limit_fail_open_total` (counter): checks allowed because the store failed
//! - `gateway_auth_rejected_total` (counter): token rejections by reason
//! - `gateway_logins_total` (counter): login attempts by outcome
//! - `gateway_lockouts_total` (counter): identifiers locked
//! - `gateway_ssrf_rejected_total` (counter): outbound URLs refused
//! - `gateway_uploads_total` (counter): uploads by outcome
//! - `gateway_store_fallback_total` (counter): operations served locally by operation
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Label values are static strings, never user input

use std::net::SocketAddr;

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint. Must run inside the runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus recorder"),
    }
}

pub fn record_rate_limited(scope: &'static str) {
    counter!("gateway_requests_rate_limited_total", "scope" => scope).increment(1);
}

pub fn record_rate_limit_fail_open() {
    counter!("gateway_rate_limit_fail_open_total").increment(1);
}

pub fn record_auth_rejected(reason: &'static str) {
    counter!("gateway_auth_rejected_total", "reason" => reason).increment(1);
}

pub fn record_login(outcome: &'static str) {
    counter!("gateway_logins_total", "outcome" => outcome).increment(1);
}

pub fn record_lockout() {
    counter!("gateway_lockouts_total").increment(1);
}

pub fn record_ssrf_rejected() {
    counter!("gateway_ssrf_rejected_total").increment(1);
}

pub fn record_upload(outcome: &'static str) {
    counter!("gateway_uploads_total", "outcome" => outcome).increment(1);
}

pub fn record_store_fallback(operation: &'static str) {
    counter!("gateway_store_fallback_total", "operation" => operation).increment(1);
}
