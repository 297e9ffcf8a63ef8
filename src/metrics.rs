//! Lightweight metrics helpers for Ladle.
//!
//! This module exposes a small set of convenience functions and RAII timers
//! wrapping the `metrics` crate macros. It intentionally avoids embedding a
//! concrete exporter (the application can initialize any compatible recorder
//! externally) while still documenting and describing Ladle-specific metric
//! names.
//!
//! Provided metrics (labels vary by family):
//! * `ladle_requests_total` (counter)
//! * `ladle_request_duration_seconds` (histogram)
//! * `ladle_upstream_requests_total` (counter)
//! * `ladle_upstream_request_duration_seconds` (histogram)
//! * `ladle_rate_limited_total` (counter per route)
//! * `ladle_breaker_transitions_total` (counter per service/state)
//! * `ladle_breaker_state` (gauge per service)
//! * `ladle_instance_health_status` (gauge per instance)
//! * `ladle_active_connections` / `ladle_active_requests` (gauges)
//!
//! The `*Timer` structs leverage `Drop` to record durations safely even when
//! early returns or errors occur.
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

// Ladle-specific metric names
pub const LADLE_REQUESTS_TOTAL: &str = "ladle_requests_total";
pub const LADLE_REQUEST_DURATION_SECONDS: &str = "ladle_request_duration_seconds";
pub const LADLE_UPSTREAM_REQUESTS_TOTAL: &str = "ladle_upstream_requests_total";
pub const LADLE_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "ladle_upstream_request_duration_seconds";
pub const LADLE_RATE_LIMITED_TOTAL: &str = "ladle_rate_limited_total";
pub const LADLE_BREAKER_TRANSITIONS_TOTAL: &str = "ladle_breaker_transitions_total";
pub const LADLE_BREAKER_STATE: &str = "ladle_breaker_state";
pub const LADLE_INSTANCE_HEALTH_STATUS: &str = "ladle_instance_health_status";
pub const LADLE_ACTIVE_CONNECTIONS: &str = "ladle_active_connections";
pub const LADLE_ACTIVE_REQUESTS: &str = "ladle_active_requests";

/// Storage for instance health gauges
pub static INSTANCE_HEALTH_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    // Register metric descriptions
    describe_counter!(
        LADLE_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        LADLE_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        LADLE_UPSTREAM_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests forwarded to upstream instances."
    );
    describe_histogram!(
        LADLE_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests forwarded to upstream instances."
    );
    describe_counter!(
        LADLE_RATE_LIMITED_TOTAL,
        Unit::Count,
        "Requests rejected by the token-bucket rate limiter."
    );
    describe_counter!(
        LADLE_BREAKER_TRANSITIONS_TOTAL,
        Unit::Count,
        "Circuit breaker state transitions (by service and target state)."
    );
    describe_gauge!(
        LADLE_BREAKER_STATE,
        "Circuit breaker state per service (0 closed, 0.5 half-open, 1 open)."
    );
    describe_gauge!(
        LADLE_INSTANCE_HEALTH_STATUS,
        "Health status of individual upstream instances (1 for healthy, 0 otherwise)"
    );
    describe_gauge!(
        LADLE_ACTIVE_CONNECTIONS,
        "Number of currently active connections to the gateway."
    );
    describe_gauge!(
        LADLE_ACTIVE_REQUESTS,
        "Number of currently active requests being processed."
    );

    Mutex::new(HashMap::new())
});

/// Storage for breaker state gauges
pub static BREAKER_STATE_GAUGES: Lazy<Mutex<HashMap<String, f64>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Set (and record) the health status gauge for an upstream instance.
pub fn set_instance_health(instance_url: &str, is_healthy: bool) {
    let health_value = if is_healthy { 1.0 } else { 0.0 };

    if let Ok(mut gauges) = INSTANCE_HEALTH_GAUGES.lock() {
        gauges.insert(instance_url.to_string(), health_value);
    } else {
        tracing::error!("Failed to acquire lock for instance health gauges");
        return;
    }

    let instance_label = instance_url.to_string();
    gauge!(LADLE_INSTANCE_HEALTH_STATUS, "instance" => instance_label).set(health_value);
}

/// Record a breaker transition and update the per-service state gauge.
pub fn record_breaker_transition(service: &str, to_state: &'static str) {
    counter!(
        LADLE_BREAKER_TRANSITIONS_TOTAL,
        "service" => service.to_string(),
        "to" => to_state
    )
    .increment(1);

    let state_value = match to_state {
        "open" => 1.0,
        "half_open" => 0.5,
        _ => 0.0,
    };

    if let Ok(mut gauges) = BREAKER_STATE_GAUGES.lock() {
        gauges.insert(service.to_string(), state_value);
    }
    gauge!(LADLE_BREAKER_STATE, "service" => service.to_string()).set(state_value);
}

/// Increment the rejected-by-rate-limit counter for a route.
pub fn increment_rate_limited(route_id: &str) {
    counter!(LADLE_RATE_LIMITED_TOTAL, "route" => route_id.to_string()).increment(1);
}

/// Increment the total request counter for an inbound gateway request.
pub fn increment_request_total(path: &str, method: &str, status: u16) {
    counter!(
        LADLE_REQUESTS_TOTAL,
        "path" => path.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(path: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        LADLE_REQUEST_DURATION_SECONDS,
        "path" => path.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Increment total count of upstream requests by outcome.
/// `status` is an HTTP status string or one of "timeout" / "transport_error".
pub fn increment_upstream_request(service: &str, status: &str) {
    counter!(
        LADLE_UPSTREAM_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed upstream request duration.
pub fn record_upstream_request_duration(service: &str, duration: std::time::Duration) {
    histogram!(
        LADLE_UPSTREAM_REQUEST_DURATION_SECONDS,
        "service" => service.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set current active connection count.
pub fn set_active_connections(count: usize) {
    gauge!(LADLE_ACTIVE_CONNECTIONS).set(count as f64);
}

/// Set current active in-flight request count.
pub fn set_active_requests(count: u64) {
    gauge!(LADLE_ACTIVE_REQUESTS).set(count as f64);
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    path: String,
    method: String,
}

impl RequestTimer {
    pub fn new(path: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            path: path.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.path, &self.method, self.start.elapsed());
    }
}

/// RAII helper measuring one upstream call attempt.
pub struct UpstreamTimer {
    start: Instant,
    service: String,
}

impl UpstreamTimer {
    pub fn new(service: &str) -> Self {
        Self {
            start: Instant::now(),
            service: service.to_string(),
        }
    }
}

impl Drop for UpstreamTimer {
    fn drop(&mut self) {
        record_upstream_request_duration(&self.service, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing Ladle metrics system");

    // Force lazy initialization of metrics descriptions
    Lazy::force(&INSTANCE_HEALTH_GAUGES);

    tracing::info!("Ladle metrics system initialized successfully");
    Ok(())
}

/// Collect a snapshot of gauge values used for ad-hoc exports.
pub fn get_current_metrics() -> HashMap<String, f64> {
    let mut metrics = HashMap::new();

    if let Ok(gauges) = INSTANCE_HEALTH_GAUGES.lock() {
        for (instance, health) in gauges.iter() {
            metrics.insert(format!("instance_health_{instance}"), *health);
        }
    }

    if let Ok(gauges) = BREAKER_STATE_GAUGES.lock() {
        for (service, state) in gauges.iter() {
            metrics.insert(format!("breaker_state_{service}"), *state);
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_instance_health() {
        set_instance_health("http://recipes-1:8080", true);

        if let Ok(gauges) = INSTANCE_HEALTH_GAUGES.lock() {
            assert_eq!(gauges.get("http://recipes-1:8080"), Some(&1.0));
        }

        set_instance_health("http://recipes-1:8080", false);

        if let Ok(gauges) = INSTANCE_HEALTH_GAUGES.lock() {
            assert_eq!(gauges.get("http://recipes-1:8080"), Some(&0.0));
        }
    }

    #[test]
    fn test_breaker_transition_updates_gauge() {
        record_breaker_transition("recipe-service", "open");
        if let Ok(gauges) = BREAKER_STATE_GAUGES.lock() {
            assert_eq!(gauges.get("recipe-service"), Some(&1.0));
        }

        record_breaker_transition("recipe-service", "closed");
        if let Ok(gauges) = BREAKER_STATE_GAUGES.lock() {
            assert_eq!(gauges.get("recipe-service"), Some(&0.0));
        }
    }

    #[test]
    fn test_request_timer() {
        let timer = RequestTimer::new("/api/v1/recipes", "GET");
        // Timer will record duration when dropped
        drop(timer);
    }

    #[test]
    fn test_upstream_timer() {
        let timer = UpstreamTimer::new("recipe-service");
        // Timer will record duration when dropped
        drop(timer);
    }

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok());
    }

    #[test]
    fn test_get_current_metrics() {
        set_instance_health("http://users-1:8080", true);
        let metrics = get_current_metrics();
        assert!(metrics.contains_key("instance_health_http://users-1:8080"));
    }
}
