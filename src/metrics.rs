//! Prometheus metrics for orders, redemption and signing.
//!
//! Names carry a `redeemer_` prefix. Recording before a recorder is
//! installed is a no-op.

use std::time::{Duration, Instant};

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use tracing::debug;

/// Order submission latency, milliseconds.
pub const METRIC_ORDER_SUBMIT_LATENCY: &str = "redeemer_order_submit_latency_ms";
/// Signing latency, milliseconds.
pub const METRIC_SIGNING_LATENCY: &str = "redeemer_signing_latency_ms";
/// Latency of one redemption attempt, milliseconds, by method.
pub const METRIC_REDEMPTION_ATTEMPT_LATENCY: &str = "redeemer_redemption_attempt_latency_ms";
/// Orders by lifecycle event (`submitted`, `filled`, `failed`).
pub const METRIC_ORDERS: &str = "redeemer_orders_total";
/// Redemption attempts by method and outcome.
pub const METRIC_REDEMPTION_ATTEMPTS: &str = "redeemer_redemption_attempts_total";
/// Finished redemption runs by result.
pub const METRIC_REDEMPTIONS: &str = "redeemer_redemptions_total";
/// Undelivered operator notifications.
pub const METRIC_NOTIFY_FAILURES: &str = "redeemer_notify_failures_total";
/// Positions in the active set.
pub const METRIC_ACTIVE_POSITIONS: &str = "redeemer_active_positions";

/// Register descriptions. Call once after the recorder is installed.
pub fn init_metrics() {
    describe_histogram!(
        METRIC_ORDER_SUBMIT_LATENCY,
        Unit::Milliseconds,
        "Time for the exchange to answer an order submission"
    );
    describe_histogram!(
        METRIC_SIGNING_LATENCY,
        Unit::Milliseconds,
        "Time to sign a meta-transaction"
    );
    describe_histogram!(
        METRIC_REDEMPTION_ATTEMPT_LATENCY,
        Unit::Milliseconds,
        "Duration of a single redemption attempt"
    );
    describe_counter!(METRIC_ORDERS, "Order lifecycle events");
    describe_counter!(
        METRIC_REDEMPTION_ATTEMPTS,
        "Redemption attempts by method and outcome"
    );
    describe_counter!(METRIC_REDEMPTIONS, "Finished redemption runs by result");
    describe_counter!(
        METRIC_NOTIFY_FAILURES,
        "Operator notifications that could not be delivered"
    );
    describe_gauge!(METRIC_ACTIVE_POSITIONS, "Positions in the active set");

    debug!("Metrics initialized");
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

/// Record one redemption attempt.
pub fn record_redemption_attempt(method: &'static str, outcome: &str, elapsed: Duration) {
    counter!(
        METRIC_REDEMPTION_ATTEMPTS,
        "method" => method,
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(METRIC_REDEMPTION_ATTEMPT_LATENCY, "method" => method).record(millis(elapsed));
}

/// Count a finished redemption run.
pub fn inc_redemptions(success: bool) {
    let result = if success { "redeemed" } else { "failed" };
    counter!(METRIC_REDEMPTIONS, "result" => result).increment(1);
}

/// An order accepted by the exchange.
pub fn inc_orders_submitted() {
    counter!(METRIC_ORDERS, "event" => "submitted").increment(1);
}

/// An order that reached FILLED.
pub fn inc_orders_filled() {
    counter!(METRIC_ORDERS, "event" => "filled").increment(1);
}

/// An order refused or lost in transport.
pub fn inc_orders_failed() {
    counter!(METRIC_ORDERS, "event" => "failed").increment(1);
}

pub fn inc_notify_failures() {
    counter!(METRIC_NOTIFY_FAILURES).increment(1);
}

pub fn set_active_positions(count: usize) {
    gauge!(METRIC_ACTIVE_POSITIONS).set(count as f64);
}

/// Records the time until drop into a histogram.
pub struct LatencyTimer {
    start: Instant,
    metric_name: &'static str,
}

impl LatencyTimer {
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }

    /// Milliseconds so far, without recording.
    pub fn elapsed_ms(&self) -> f64 {
        millis(self.start.elapsed())
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(self.metric_name).record(millis(self.start.elapsed()));
    }
}

/// Timer for an order submission.
pub fn timer_order_submit() -> LatencyTimer {
    LatencyTimer::new(METRIC_ORDER_SUBMIT_LATENCY)
}

/// Timer for a signature.
pub fn timer_signing() -> LatencyTimer {
    LatencyTimer::new(METRIC_SIGNING_LATENCY)
}
