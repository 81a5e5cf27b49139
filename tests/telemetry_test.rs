//! Integration tests for telemetry initialization and span helpers.

use crowdclaim::model::ClaimId;
use crowdclaim::telemetry::{self, TelemetryConfig};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = TelemetryConfig::local("crowdclaim-test", "debug");
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = telemetry::init_telemetry(config);
}

#[test]
fn claim_span_records_id_and_outcome() {
    let span = telemetry::work::start_claim_span("claim.assign", "heval");
    telemetry::work::record_claim_id(&span, &ClaimId::new());
    telemetry::work::record_outcome(&span, "created", 2);
}

#[test]
fn metric_instruments_build_without_provider() {
    use opentelemetry::KeyValue;
    telemetry::metrics::claims_assigned().add(
        1,
        &[
            KeyValue::new("scope", "heval"),
            KeyValue::new("result", "created"),
        ],
    );
    telemetry::metrics::store_retries().add(1, &[KeyValue::new("operation", "assign")]);
    telemetry::metrics::operation_duration_ms()
        .record(1.5, &[KeyValue::new("operation", "claim.assign")]);
}
