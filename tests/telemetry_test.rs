//! Integration tests for telemetry initialization and span helpers.

use channel_fabric::model::JobId;
use channel_fabric::telemetry::channel::{record_tick_result, start_job_span, start_tick_span};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; a second
    // initialization in the same binary may return Err, which is fine here.
    let config = channel_fabric::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "channel-fabric-test".to_string(),
        instance_id: "test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = channel_fabric::telemetry::init_telemetry(config);
}

#[test]
fn job_span_creates() {
    let span = start_job_span("batch_1", JobId(42), 2);
    let _entered = span.enter();
}

#[test]
fn tick_span_creates_and_records_result() {
    let span = start_tick_span("3f2c9a");
    record_tick_result(&span, 2, 1);
}
