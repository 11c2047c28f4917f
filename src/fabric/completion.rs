//! Completion detector.
//!
//! A channel is done when its input is closed (`final` in the registry) and
//! its queue reports nothing waiting, delayed, or active. Zero counts alone
//! are not enough: while a channel is still `ready`, more items can land at
//! any moment. Deleting the registry entry is the claim: of several checks
//! racing past both gates, in this process or another, only the one whose
//! delete removed the entry emits `done`.

use opentelemetry::KeyValue;
use tracing::{debug, info};

use super::Fabric;
use crate::event::EventKind;
use crate::model::Counters;
use crate::queue::ChannelQueue;
use crate::telemetry::metrics;

/// Outcome of one completion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCheck {
    /// Items are still waiting, delayed, or active.
    Busy,
    /// The registry no longer lists the channel.
    Absent,
    /// Drained, but input is not closed yet.
    Open,
    /// This check removed the channel and emitted `done`.
    Done(Counters),
    /// Another check removed the channel first.
    LostRace,
    /// The queue or registry could not be read; try again on the next trigger.
    Inconclusive,
}

impl CompletionCheck {
    fn label(&self) -> &'static str {
        match self {
            CompletionCheck::Busy => "busy",
            CompletionCheck::Absent => "absent",
            CompletionCheck::Open => "open",
            CompletionCheck::Done(_) => "done",
            CompletionCheck::LostRace => "lost_race",
            CompletionCheck::Inconclusive => "inconclusive",
        }
    }
}

pub(crate) async fn check(fabric: &Fabric, channel: &str, queue: &ChannelQueue) -> CompletionCheck {
    let result = evaluate(fabric, channel, queue).await;
    metrics::completion_checks().add(1, &[KeyValue::new("result", result.label())]);
    result
}

async fn evaluate(fabric: &Fabric, channel: &str, queue: &ChannelQueue) -> CompletionCheck {
    let counts = match queue.job_counts().await {
        Ok(counts) => counts,
        Err(e) => {
            debug!(channel, error = %e, "job counts unavailable, completion check skipped");
            return CompletionCheck::Inconclusive;
        }
    };
    if !counts.is_drained() {
        return CompletionCheck::Busy;
    }

    let registry = fabric.registry();
    let entry = match registry.get(channel).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return CompletionCheck::Absent,
        Err(e) => {
            debug!(channel, error = %e, "registry unavailable, completion check skipped");
            return CompletionCheck::Inconclusive;
        }
    };
    if !entry.is_final() {
        return CompletionCheck::Open;
    }

    let stats = match registry.get_counters(channel).await {
        Ok(stats) => stats,
        Err(e) => {
            debug!(channel, error = %e, "counters unavailable, completion check skipped");
            return CompletionCheck::Inconclusive;
        }
    };
    match registry.delete(channel).await {
        Ok(true) => {
            info!(
                channel,
                total = stats.total,
                success = stats.success,
                failed = stats.failed,
                "channel done"
            );
            fabric.emit(channel, EventKind::Done { stats });
            CompletionCheck::Done(stats)
        }
        Ok(false) => CompletionCheck::LostRace,
        Err(e) => {
            debug!(channel, error = %e, "registry delete failed, completion check skipped");
            CompletionCheck::Inconclusive
        }
    }
}
