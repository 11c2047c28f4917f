//! Span helpers for channel work.
//!
//! Job spans wrap one attempt of one item; tick spans wrap one
//! reconciliation pass.

use tracing::Span;

use crate::model::JobId;

/// Start a span for one attempt of an item.
pub fn start_job_span(channel: &str, job_id: JobId, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "fabric.channel" = channel,
        "job.id" = %job_id,
        "job.attempt" = attempt,
    )
}

/// Start a span for one reconciliation tick.
///
/// `tick.started` and `tick.torn_down` are declared empty and filled in via
/// [`record_tick_result`].
pub fn start_tick_span(process_id: &str) -> Span {
    tracing::debug_span!(
        "fabric.tick",
        "fabric.process" = process_id,
        "tick.started" = tracing::field::Empty,
        "tick.torn_down" = tracing::field::Empty,
    )
}

pub fn record_tick_result(span: &Span, started: usize, torn_down: usize) {
    span.record("tick.started", started);
    span.record("tick.torn_down", torn_down);
}
