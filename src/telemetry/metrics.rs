//! Metric instrument factories for crowdclaim.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"crowdclaim"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for crowdclaim instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("crowdclaim")
}

/// Counter: assignment requests by outcome.
/// Labels: `scope`, `result` ("created" | "resumed" | "no_work_available" |
/// "already_completed" | "retry_later" | "internal").
pub fn claims_assigned() -> Counter<u64> {
    meter()
        .u64_counter("crowdclaim.claims.assigned")
        .with_description("Assignment requests by outcome")
        .build()
}

/// Counter: completion requests by outcome.
/// Labels: `scope`, `result`.
pub fn claims_completed() -> Counter<u64> {
    meter()
        .u64_counter("crowdclaim.claims.completed")
        .with_description("Completion requests by outcome")
        .build()
}

/// Counter: stale claims returned to the pool.
/// Labels: `scope`.
pub fn claims_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("crowdclaim.claims.reclaimed")
        .with_description("Stale claims reclaimed")
        .build()
}

/// Counter: transient store failures that were retried.
/// Labels: `operation`.
pub fn store_retries() -> Counter<u64> {
    meter()
        .u64_counter("crowdclaim.store.retries")
        .with_description("Retried transient store failures")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("crowdclaim.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
