//! Metric instrument factories for channel-fabric.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"channel-fabric"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for channel-fabric instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("channel-fabric")
}

/// Counter: items enqueued through `add`.
/// Labels: `channel`.
pub fn items_added() -> Counter<u64> {
    meter()
        .u64_counter("fabric.items.added")
        .with_description("Number of items enqueued")
        .build()
}

/// Counter: relayed item outcomes.
/// Labels: `channel`, `outcome` ("active" | "completed" | "failed" | "stalled").
pub fn item_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("fabric.items.outcomes")
        .with_description("Item lifecycle events seen by the relay")
        .build()
}

/// Counter: local channel handles created and torn down.
/// Labels: `action` ("started" | "torn_down"), `declared` (bool, started only).
pub fn channel_lifecycle() -> Counter<u64> {
    meter()
        .u64_counter("fabric.channels.lifecycle")
        .with_description("Local channel handles created and torn down")
        .build()
}

/// Counter: reconciliation ticks.
/// Labels: `result` ("ok" | "error").
pub fn reconcile_ticks() -> Counter<u64> {
    meter()
        .u64_counter("fabric.reconcile.ticks")
        .with_description("Reconciliation passes run")
        .build()
}

/// Counter: completion checks by result.
/// Labels: `result` ("busy" | "absent" | "open" | "done" | "lost_race" | "inconclusive").
pub fn completion_checks() -> Counter<u64> {
    meter()
        .u64_counter("fabric.completion.checks")
        .with_description("Completion detector decisions")
        .build()
}

/// Counter: queue backend operations (create, send, read, archive, ...).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("fabric.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: handler duration per attempt in milliseconds.
/// Labels: `channel`, `outcome`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("fabric.job.duration_ms")
        .with_description("Handler duration per attempt in milliseconds")
        .with_unit("ms")
        .build()
}
