//! Structured events emitted on the process-wide stream.
//!
//! Observers never see a queue's raw events. Everything is re-emitted here
//! tagged with the channel it came from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Counters, JobId};
use crate::queue::QueueEvent;

/// A structured event emitted by the fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic per-process sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Ready,
    Error {
        message: String,
    },
    Active {
        job_id: JobId,
        attempt: u32,
    },
    Stalled {
        job_id: JobId,
        attempt: u32,
    },
    Progress {
        job_id: JobId,
        progress: serde_json::Value,
    },
    Completed {
        job_id: JobId,
        result: serde_json::Value,
    },
    Failed {
        job_id: JobId,
        error: String,
        attempts_made: u32,
    },
    Paused,
    Resumed,
    Cleaned {
        removed: u64,
    },
    /// The channel drained after `final` and was removed from the registry.
    Done {
        stats: Counters,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Ready => "ready",
            EventKind::Error { .. } => "error",
            EventKind::Active { .. } => "active",
            EventKind::Stalled { .. } => "stalled",
            EventKind::Progress { .. } => "progress",
            EventKind::Completed { .. } => "completed",
            EventKind::Failed { .. } => "failed",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Cleaned { .. } => "cleaned",
            EventKind::Done { .. } => "done",
        }
    }
}

impl From<QueueEvent> for EventKind {
    fn from(event: QueueEvent) -> Self {
        match event {
            QueueEvent::Ready => EventKind::Ready,
            QueueEvent::Error { message } => EventKind::Error { message },
            QueueEvent::Active { job_id, attempt } => EventKind::Active { job_id, attempt },
            QueueEvent::Stalled { job_id, attempt } => EventKind::Stalled { job_id, attempt },
            QueueEvent::Progress { job_id, progress } => EventKind::Progress { job_id, progress },
            QueueEvent::Completed { job_id, result } => EventKind::Completed { job_id, result },
            QueueEvent::Failed {
                job_id,
                error,
                attempts_made,
            } => EventKind::Failed {
                job_id,
                error,
                attempts_made,
            },
            QueueEvent::Paused => EventKind::Paused,
            QueueEvent::Resumed => EventKind::Resumed,
            QueueEvent::Cleaned { removed } => EventKind::Cleaned { removed },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_as_tagged_union() {
        let event = Event {
            seq: 7,
            timestamp: Utc::now(),
            channel: "batch_1".to_string(),
            kind: EventKind::Done {
                stats: Counters {
                    total: 4,
                    success: 4,
                    failed: 0,
                },
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["channel"], "batch_1");
        assert_eq!(json["kind"]["type"], "done");
        assert_eq!(json["kind"]["stats"]["success"], 4);
    }
}
