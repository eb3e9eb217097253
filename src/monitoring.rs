//! Metric names and recording helpers.
//!
//! Counters are recorded through the `metrics` facade; wiring an exporter
//! is the embedding application's concern. Names mirror the decision
//! points of the coordinator so dashboards can follow a request through
//! cache, collapse, throttle and placeholder.

use metrics::counter;

/// Cache lookup outcomes, labelled by status.
pub const CACHE_RATIO: &str = "cache_ratio";
/// Requests that joined an in-flight owner instead of computing.
pub const COLLAPSED_COUNT: &str = "collapsed_count";
/// Engine passes rejected at the throttler deadline.
pub const THROTTLED_COUNT: &str = "throttled_count";
/// Requests entering the coordinator.
pub const REQUEST_COUNT: &str = "request_count";
/// Placeholder renders performed.
pub const PLACEHOLDER_COUNT: &str = "placeholder_count";

pub const CACHE_HIT: &str = "hit";
pub const CACHE_MISS: &str = "miss";
pub const CACHE_EXPIRED: &str = "expired";
pub const CACHE_STALE: &str = "stale";
pub const CACHE_WRITE_SKIPPED: &str = "write_skipped";

/// Record one cache lookup outcome.
pub fn cache_lookup(status: &'static str) {
    counter!(CACHE_RATIO, "status" => status).increment(1);
}

/// Record a collapsed request.
pub fn collapsed() {
    counter!(COLLAPSED_COUNT).increment(1);
}

/// Record a throttled engine pass.
pub fn throttled() {
    counter!(THROTTLED_COUNT).increment(1);
}

/// Record an incoming request, labelled by method.
pub fn request(method: &'static str) {
    counter!(REQUEST_COUNT, "method" => method).increment(1);
}

/// Record a placeholder render.
pub fn placeholder_rendered() {
    counter!(PLACEHOLDER_COUNT).increment(1);
}
