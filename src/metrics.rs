//! Metrics helpers for the gateway.
//!
//! Thin wrappers and RAII timers over the `metrics` crate macros. No exporter is
//! embedded here; the binary installs a Prometheus recorder when configured and
//! every call below is a no-op otherwise.
//!
//! Provided metrics (labels vary by family):
//! * `gateway_requests_total` (counter: service, method, status)
//! * `gateway_request_duration_seconds` (histogram: service, method)
//! * `gateway_upstream_attempts_total` (counter: service, result)
//! * `gateway_upstream_request_duration_seconds` (histogram: service, method)
//! * `gateway_circuit_state` (gauge per service, 0 closed / 1 half-open / 2 open)
//! * `gateway_circuit_rejections_total` (counter: service)
//! * `gateway_cache_lookups_total` (counter: result)
//! * `gateway_stale_responses_total` (counter: service)
//! * `gateway_service_health` (gauge per service)
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

use crate::core::{circuit_breaker::CircuitState, classifier::Classification};

pub const GATEWAY_REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const GATEWAY_REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
pub const GATEWAY_UPSTREAM_ATTEMPTS_TOTAL: &str = "gateway_upstream_attempts_total";
pub const GATEWAY_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "gateway_upstream_request_duration_seconds";
pub const GATEWAY_CIRCUIT_STATE: &str = "gateway_circuit_state";
pub const GATEWAY_CIRCUIT_REJECTIONS_TOTAL: &str = "gateway_circuit_rejections_total";
pub const GATEWAY_CACHE_LOOKUPS_TOTAL: &str = "gateway_cache_lookups_total";
pub const GATEWAY_STALE_RESPONSES_TOTAL: &str = "gateway_stale_responses_total";
pub const GATEWAY_SERVICE_HEALTH: &str = "gateway_service_health";

/// Last value written to each per-service gauge, keyed by `family/service`.
pub static SERVICE_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_counter!(
        GATEWAY_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests answered by the gateway."
    );
    describe_histogram!(
        GATEWAY_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests answered by the gateway."
    );
    describe_counter!(
        GATEWAY_UPSTREAM_ATTEMPTS_TOTAL,
        Unit::Count,
        "Upstream attempts by classification (success, retryable, non_retryable)."
    );
    describe_histogram!(
        GATEWAY_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of individual upstream attempts."
    );
    describe_gauge!(
        GATEWAY_CIRCUIT_STATE,
        "Circuit breaker state per service (0 closed, 1 half-open, 2 open)."
    );
    describe_counter!(
        GATEWAY_CIRCUIT_REJECTIONS_TOTAL,
        Unit::Count,
        "Requests rejected without an upstream call because the breaker was not admitting."
    );
    describe_counter!(
        GATEWAY_CACHE_LOOKUPS_TOTAL,
        Unit::Count,
        "Response cache lookups by result (fresh, stale, expired, miss)."
    );
    describe_counter!(
        GATEWAY_STALE_RESPONSES_TOTAL,
        Unit::Count,
        "Cached responses served in place of a failed upstream call."
    );
    describe_gauge!(
        GATEWAY_SERVICE_HEALTH,
        "Last probed health of each service (1 healthy, 0 unhealthy)."
    );

    Mutex::new(HashMap::new())
});

fn remember_gauge(family: &str, service: &str, value: f64) {
    if let Ok(mut gauges) = SERVICE_GAUGES.lock() {
        gauges.insert(format!("{family}/{service}"), value);
    } else {
        tracing::error!("Failed to acquire lock for service gauges");
    }
}

/// Record the probed health of a service.
pub fn set_service_health(service: &str, healthy: bool) {
    let value = if healthy { 1.0 } else { 0.0 };
    remember_gauge(GATEWAY_SERVICE_HEALTH, service, value);
    gauge!(GATEWAY_SERVICE_HEALTH, "service" => service.to_string()).set(value);
}

/// Record a breaker state transition.
pub fn set_circuit_state(service: &str, state: CircuitState) {
    let value = state.as_gauge();
    remember_gauge(GATEWAY_CIRCUIT_STATE, service, value);
    gauge!(GATEWAY_CIRCUIT_STATE, "service" => service.to_string()).set(value);
}

pub fn increment_circuit_rejections(service: &str) {
    counter!(GATEWAY_CIRCUIT_REJECTIONS_TOTAL, "service" => service.to_string()).increment(1);
}

pub fn increment_upstream_attempts(service: &str, classification: Classification) {
    let result = match classification {
        Classification::Success => "success",
        Classification::RetryableFailure => "retryable",
        Classification::NonRetryableFailure => "non_retryable",
    };
    counter!(
        GATEWAY_UPSTREAM_ATTEMPTS_TOTAL,
        "service" => service.to_string(),
        "result" => result
    )
    .increment(1);
}

/// `result` is one of `fresh`, `stale`, `expired`, `miss`.
pub fn increment_cache_lookup(result: &'static str) {
    counter!(GATEWAY_CACHE_LOOKUPS_TOTAL, "result" => result).increment(1);
}

pub fn increment_stale_responses(service: &str) {
    counter!(GATEWAY_STALE_RESPONSES_TOTAL, "service" => service.to_string()).increment(1);
}

/// Count an answered inbound request.
pub fn increment_request_total(service: &str, method: &str, status: u16) {
    counter!(
        GATEWAY_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(service: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        GATEWAY_REQUEST_DURATION_SECONDS,
        "service" => service.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_upstream_request_duration(
    service: &str,
    method: &str,
    duration: std::time::Duration,
) {
    histogram!(
        GATEWAY_UPSTREAM_REQUEST_DURATION_SECONDS,
        "service" => service.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    service: String,
    method: String,
}

impl RequestTimer {
    pub fn new(service: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            service: service.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.service, &self.method, self.start.elapsed());
    }
}

/// RAII helper measuring one upstream attempt.
pub struct UpstreamRequestTimer {
    start: Instant,
    service: String,
    method: String,
}

impl UpstreamRequestTimer {
    pub fn new(service: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            service: service.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for UpstreamRequestTimer {
    fn drop(&mut self) {
        record_upstream_request_duration(&self.service, &self.method, self.start.elapsed());
    }
}

/// Register metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    Lazy::force(&SERVICE_GAUGES);
    tracing::info!("Gateway metrics descriptions registered");
    Ok(())
}

/// Snapshot of per-service gauge values, for the status endpoint and tests.
pub fn get_current_metrics() -> HashMap<String, f64> {
    SERVICE_GAUGES
        .lock()
        .map(|gauges| gauges.clone())
        .unwrap_or_default()
}
