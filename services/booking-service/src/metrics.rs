// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the booking service.
//
// METRIC TYPES USED:
// - Counter: requests, bookings by outcome, cancellations, promotions
// - Gauge: available seats per schedule
// - Histogram: request latency, store commit latency
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use uuid::Uuid;

// =============================================================================
// METRIC NAMES
// =============================================================================

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Labels: outcome (confirmed/waitlisted/rejected)
pub const BOOKINGS_TOTAL: &str = "bookings_total";

/// Labels: previous_status (confirmed/waitlisted)
pub const CANCELLATIONS_TOTAL: &str = "cancellations_total";

pub const WAITLIST_PROMOTIONS_TOTAL: &str = "waitlist_promotions_total";

/// Labels: schedule
pub const SCHEDULE_AVAILABLE_SEATS: &str = "schedule_available_seats";

pub const DB_COMMIT_DURATION_SECONDS: &str = "db_commit_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Install the global Prometheus recorder and return its render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_COMMIT_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(BOOKINGS_TOTAL, "Booking requests by allocation outcome");
    describe_counter!(CANCELLATIONS_TOTAL, "Cancelled bookings by their previous status");
    describe_counter!(WAITLIST_PROMOTIONS_TOTAL, "Waitlisted bookings confirmed by promotion");
    describe_gauge!(SCHEDULE_AVAILABLE_SEATS, "Seats currently available per schedule");
    describe_histogram!(DB_COMMIT_DURATION_SECONDS, "Allocation commit latency in seconds");

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================
// Without an installed recorder (tests) these are no-ops.

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

pub fn record_booking(outcome: &str) {
    counter!(BOOKINGS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn record_cancellation(previous_status: &str) {
    counter!(CANCELLATIONS_TOTAL, "previous_status" => previous_status.to_string()).increment(1);
}

pub fn record_promotions(count: usize) {
    if count > 0 {
        counter!(WAITLIST_PROMOTIONS_TOTAL).increment(count as u64);
    }
}

pub fn set_available_seats(schedule_id: Uuid, available: i32) {
    gauge!(SCHEDULE_AVAILABLE_SEATS, "schedule" => schedule_id.to_string()).set(available as f64);
}

pub fn record_commit(duration_secs: f64) {
    histogram!(DB_COMMIT_DURATION_SECONDS).record(duration_secs);
}
