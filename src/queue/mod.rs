//! Per-channel queue engine.
//!
//! A [`JobBackend`] persists items for every channel of a process (pgmq in
//! production, [`MemoryBackend`] in tests). A [`ChannelQueue`] binds one
//! channel to a backend, runs handler workers against it, and reports item
//! lifecycle as [`QueueEvent`]s.

pub mod channel;
pub mod command;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::model::{CounterKind, Delivery, Envelope, JobCounts, JobId};

pub use channel::{ChannelQueue, QueueSettings};
pub use command::CommandHandler;
pub use memory::MemoryBackend;

/// Storage and delivery of queued items, shared by all channels of a process.
///
/// Delivery is at-least-once: a popped item becomes visible again once its
/// lease runs out unless it is acked or rescheduled first.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Connection handshake.
    async fn ping(&self) -> Result<()>;

    /// Create the channel's queue if it does not exist yet.
    async fn ensure(&self, channel: &str) -> Result<()>;

    async fn push(&self, channel: &str, envelope: &Envelope) -> Result<JobId>;

    /// Hand out the oldest visible item, hiding it for `lease`.
    async fn pop(&self, channel: &str, lease: Duration) -> Result<Option<Delivery>>;

    /// Finish an item. `remove` deletes it; otherwise it is archived.
    async fn ack(&self, channel: &str, id: JobId, remove: bool) -> Result<()>;

    /// Make an in-flight item visible again after `delay`.
    async fn set_visibility(&self, channel: &str, id: JobId, delay: Duration) -> Result<()>;

    async fn counts(&self, channel: &str) -> Result<JobCounts>;

    /// Drop every item still queued for the channel. Returns how many went.
    async fn purge(&self, channel: &str) -> Result<u64>;
}

/// Lifecycle events reported by a [`ChannelQueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueEvent {
    Ready,
    Error {
        message: String,
    },
    Active {
        job_id: JobId,
        attempt: u32,
    },
    /// The handler overran its timeout; the attempt is abandoned.
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
    /// Final failure, after every attempt was used.
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
}

pub type QueueEventSender = mpsc::UnboundedSender<QueueEvent>;

/// Item counters kept outside the queue, updated by workers while the item
/// is still held by the backend.
///
/// `Total` is counted before each attempt runs. `Success` and `Failed` are
/// counted before the terminal ack, so once a channel's queue reads drained
/// every finished item is already reflected in the counters.
#[async_trait]
pub trait Tally: Send + Sync + 'static {
    async fn count(&self, channel: &str, kind: CounterKind);
}

/// Failure returned by a handler. Failures are retried per the item's policy.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct JobError(String);

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<crate::error::Error> for JobError {
    fn from(e: crate::error::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<std::io::Error> for JobError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// What a handler gets to know about the item it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub channel: String,
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt: u32,
    events: QueueEventSender,
}

impl JobContext {
    pub(crate) fn new(channel: &str, job_id: JobId, attempt: u32, events: QueueEventSender) -> Self {
        Self {
            channel: channel.to_string(),
            job_id,
            attempt,
            events,
        }
    }

    /// Report progress; observers see it as a `progress` event.
    pub fn progress(&self, progress: serde_json::Value) {
        let _ = self.events.send(QueueEvent::Progress {
            job_id: self.job_id,
            progress,
        });
    }
}

/// The user-supplied item processor. Opaque to the fabric.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        data: serde_json::Value,
        ctx: JobContext,
    ) -> std::result::Result<serde_json::Value, JobError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<serde_json::Value, JobError>> + Send + 'static,
{
    async fn handle(
        &self,
        data: serde_json::Value,
        ctx: JobContext,
    ) -> std::result::Result<serde_json::Value, JobError> {
        (self.0)(data, ctx).await
    }
}

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<serde_json::Value, JobError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
