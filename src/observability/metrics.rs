//! Metrics collection.
//!
//! # Metrics
//! - `harbor_requests_total` (counter): requests by method, status
//! - `harbor_request_duration_seconds` (histogram): latency distribution
//! - `harbor_dispatches_total` (counter): forward/include calls by kind
//! - `harbor_handler_unavailable_total` (counter): 503s by wrapper
//!
//! # Design Decisions
//! - Recorded through the `metrics` facade; the embedding binary decides
//!   whether and where to export
//! - Labels kept low-cardinality (method, status class, wrapper name)

use std::time::Instant;

use metrics::{counter, histogram};

/// Account one request at the engine stage.
pub fn record_request(method: &str, status: u16, started: Instant) {
    counter!(
        "harbor_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
    histogram!("harbor_request_duration_seconds").record(started.elapsed().as_secs_f64());
}

/// Account one forward or include.
pub fn record_dispatch(kind: &'static str) {
    counter!("harbor_dispatches_total", "kind" => kind).increment(1);
}

/// Account one unavailability rejection.
pub fn record_unavailable(wrapper: &str) {
    counter!(
        "harbor_handler_unavailable_total",
        "wrapper" => wrapper.to_string(),
    )
    .increment(1);
}
