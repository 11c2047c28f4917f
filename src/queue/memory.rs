//! In-process queue backend for tests and single-node development.
//!
//! Follows the pgmq visibility model: a popped item stays in the queue with
//! its visibility pushed into the future until it is acked or rescheduled.
//! Clones share state, like several processes sharing one database.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::JobBackend;
use crate::error::{Error, Result};
use crate::model::{Delivery, Envelope, JobCounts, JobId};

struct MemJob {
    envelope: Envelope,
    read_ct: u32,
    visible_at: Instant,
}

#[derive(Default)]
struct MemQueue {
    jobs: BTreeMap<i64, MemJob>,
    archive: Vec<(JobId, Envelope)>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    queues: HashMap<String, MemQueue>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    disconnected: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a lost connection: every call fails until reconnected.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    /// Items archived instead of removed (see `remove_on_complete` / `remove_on_fail`).
    pub fn archived(&self, channel: &str) -> Vec<(JobId, Envelope)> {
        self.lock()
            .queues
            .get(channel)
            .map(|q| q.archive.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(Error::Engine("connection lost".to_string()))
        } else {
            Ok(())
        }
    }
}

fn missing(channel: &str) -> Error {
    Error::Engine(format!("queue {channel} does not exist"))
}

#[async_trait]
impl JobBackend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn ensure(&self, channel: &str) -> Result<()> {
        self.check()?;
        self.lock().queues.entry(channel.to_string()).or_default();
        Ok(())
    }

    async fn push(&self, channel: &str, envelope: &Envelope) -> Result<JobId> {
        self.check()?;
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        let queue = state.queues.get_mut(channel).ok_or_else(|| missing(channel))?;
        queue.jobs.insert(
            id,
            MemJob {
                envelope: envelope.clone(),
                read_ct: 0,
                visible_at: Instant::now(),
            },
        );
        Ok(JobId(id))
    }

    async fn pop(&self, channel: &str, lease: Duration) -> Result<Option<Delivery>> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.lock();
        let queue = state.queues.get_mut(channel).ok_or_else(|| missing(channel))?;
        let Some((id, job)) = queue.jobs.iter_mut().find(|(_, job)| job.visible_at <= now) else {
            return Ok(None);
        };
        job.read_ct += 1;
        job.visible_at = now + lease;
        Ok(Some(Delivery {
            id: JobId(*id),
            attempt: job.read_ct,
            envelope: job.envelope.clone(),
        }))
    }

    async fn ack(&self, channel: &str, id: JobId, remove: bool) -> Result<()> {
        self.check()?;
        let mut state = self.lock();
        let queue = state.queues.get_mut(channel).ok_or_else(|| missing(channel))?;
        if let Some(job) = queue.jobs.remove(&id.0) {
            if !remove {
                queue.archive.push((id, job.envelope));
            }
        }
        Ok(())
    }

    async fn set_visibility(&self, channel: &str, id: JobId, delay: Duration) -> Result<()> {
        self.check()?;
        let mut state = self.lock();
        let queue = state.queues.get_mut(channel).ok_or_else(|| missing(channel))?;
        if let Some(job) = queue.jobs.get_mut(&id.0) {
            job.visible_at = Instant::now() + delay;
        }
        Ok(())
    }

    async fn counts(&self, channel: &str) -> Result<JobCounts> {
        self.check()?;
        let now = Instant::now();
        let state = self.lock();
        let mut counts = JobCounts::default();
        if let Some(queue) = state.queues.get(channel) {
            for job in queue.jobs.values() {
                if job.visible_at <= now {
                    counts.waiting += 1;
                } else if job.read_ct == 0 {
                    counts.delayed += 1;
                } else {
                    counts.active += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn purge(&self, channel: &str) -> Result<u64> {
        self.check()?;
        let mut state = self.lock();
        Ok(state
            .queues
            .get_mut(channel)
            .map(|queue| {
                let removed = queue.jobs.len() as u64;
                queue.jobs.clear();
                removed
            })
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobPolicy;

    fn envelope(n: i64) -> Envelope {
        Envelope {
            data: serde_json::json!({ "n": n }),
            opts: JobPolicy::default(),
        }
    }

    #[tokio::test]
    async fn push_requires_ensured_queue() {
        let backend = MemoryBackend::new();
        assert!(backend.push("batch_1", &envelope(1)).await.is_err());
        backend.ensure("batch_1").await.unwrap();
        assert!(backend.push("batch_1", &envelope(1)).await.is_ok());
    }

    #[tokio::test]
    async fn popped_items_count_as_active_until_acked() {
        let backend = MemoryBackend::new();
        backend.ensure("batch_1").await.unwrap();
        let id = backend.push("batch_1", &envelope(1)).await.unwrap();
        backend.push("batch_1", &envelope(2)).await.unwrap();

        let delivery = backend
            .pop("batch_1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.id, id);
        assert_eq!(delivery.attempt, 1);

        let counts = backend.counts("batch_1").await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.active, 1);

        backend.ack("batch_1", id, false).await.unwrap();
        let counts = backend.counts("batch_1").await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(backend.archived("batch_1").len(), 1);
    }

    #[tokio::test]
    async fn rescheduled_item_is_redelivered_with_next_attempt() {
        let backend = MemoryBackend::new();
        backend.ensure("batch_1").await.unwrap();
        let id = backend.push("batch_1", &envelope(1)).await.unwrap();

        backend.pop("batch_1", Duration::from_secs(30)).await.unwrap();
        backend
            .set_visibility("batch_1", id, Duration::ZERO)
            .await
            .unwrap();

        let again = backend
            .pop("batch_1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn disconnected_backend_fails_every_call() {
        let backend = MemoryBackend::new();
        backend.ensure("batch_1").await.unwrap();
        backend.set_disconnected(true);
        assert!(backend.ping().await.is_err());
        assert!(backend.counts("batch_1").await.is_err());
        backend.set_disconnected(false);
        assert!(backend.counts("batch_1").await.is_ok());
    }
}
