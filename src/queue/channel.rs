//! One channel's queue: enqueue, worker loop, retries, teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use super::{JobBackend, JobContext, JobHandler, QueueEvent, QueueEventSender, Tally};
use crate::error::{Error, Result};
use crate::model::{CounterKind, Delivery, JobCounts, JobId, JobOptions, JobPolicy};
use crate::telemetry::{channel::start_job_span, metrics};
use opentelemetry::KeyValue;

/// Extra lease beyond an item's timeout, so a slow ack does not race redelivery.
pub(crate) const LEASE_MARGIN: Duration = Duration::from_secs(5);

/// Worker tuning shared by every channel of a process.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// How long a worker sleeps after finding the queue empty.
    pub poll_interval: Duration,
    /// Lease taken when popping, before the item's own timeout is known.
    pub lease: Duration,
    /// Policy applied to items added without explicit options.
    pub defaults: JobPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(30),
            defaults: JobPolicy::default(),
        }
    }
}

struct QueueInner {
    channel: String,
    backend: Arc<dyn JobBackend>,
    events: QueueEventSender,
    settings: QueueSettings,
    tally: Option<Arc<dyn Tally>>,
    paused: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    /// Set once every worker has stopped.
    finished: watch::Sender<bool>,
    wake: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl QueueInner {
    fn emit(&self, event: QueueEvent) {
        // The receiver goes away once the channel is torn down.
        let _ = self.events.send(event);
    }

    async fn count(&self, kind: CounterKind) {
        if let Some(tally) = &self.tally {
            tally.count(&self.channel, kind).await;
        }
    }
}

/// Handle to one channel's queue. Clones share the same workers.
#[derive(Clone)]
pub struct ChannelQueue {
    inner: Arc<QueueInner>,
}

impl ChannelQueue {
    /// Bind `channel` to `backend`. No I/O happens until [`ChannelQueue::ready`].
    pub fn open(
        channel: &str,
        backend: Arc<dyn JobBackend>,
        events: QueueEventSender,
        settings: QueueSettings,
    ) -> Self {
        Self::build(channel, backend, events, settings, None)
    }

    /// Like [`ChannelQueue::open`], with workers reporting item outcomes to
    /// `tally` before the backend lets go of the item.
    pub fn open_counted(
        channel: &str,
        backend: Arc<dyn JobBackend>,
        events: QueueEventSender,
        settings: QueueSettings,
        tally: Arc<dyn Tally>,
    ) -> Self {
        Self::build(channel, backend, events, settings, Some(tally))
    }

    fn build(
        channel: &str,
        backend: Arc<dyn JobBackend>,
        events: QueueEventSender,
        settings: QueueSettings,
        tally: Option<Arc<dyn Tally>>,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        let (finished, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                channel: channel.to_string(),
                backend,
                events,
                settings,
                tally,
                paused,
                shutdown,
                finished,
                wake: Notify::new(),
                workers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Connection handshake: ping the backend and create the queue.
    /// Emits `ready` on success.
    pub async fn ready(&self) -> Result<()> {
        self.inner.backend.ping().await?;
        self.inner.backend.ensure(&self.inner.channel).await?;
        self.inner.emit(QueueEvent::Ready);
        Ok(())
    }

    /// Start `concurrency` workers running `handler`. Zero starts none, which
    /// leaves the queue usable for producing only.
    pub fn process(&self, concurrency: usize, handler: Arc<dyn JobHandler>) {
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for worker in 0..concurrency {
            let inner = Arc::clone(&self.inner);
            let handler = Arc::clone(&handler);
            workers.push(tokio::spawn(async move {
                work_loop(inner, handler, worker).await;
            }));
        }
    }

    /// Enqueue one item with `options` laid over the default policy.
    pub async fn add(&self, data: serde_json::Value, options: JobOptions) -> Result<JobId> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelNotActive(self.inner.channel.clone()));
        }
        let envelope = crate::model::Envelope {
            data,
            opts: options.resolve(&self.inner.settings.defaults),
        };
        let id = self.inner.backend.push(&self.inner.channel, &envelope).await?;
        self.inner.wake.notify_one();
        Ok(id)
    }

    pub async fn job_counts(&self) -> Result<JobCounts> {
        self.inner.backend.counts(&self.inner.channel).await
    }

    /// Drop everything still queued. Emits `cleaned`.
    pub async fn empty(&self) -> Result<u64> {
        let removed = self.inner.backend.purge(&self.inner.channel).await?;
        self.inner.emit(QueueEvent::Cleaned { removed });
        Ok(removed)
    }

    pub fn pause(&self) {
        if !self.inner.paused.send_replace(true) {
            self.inner.emit(QueueEvent::Paused);
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.send_replace(false) {
            self.inner.emit(QueueEvent::Resumed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`ChannelQueue::close`] has stopped every worker. No
    /// worker event is emitted after that.
    pub(crate) async fn finished(&self) {
        let mut finished = self.inner.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }

    /// Stop the workers. `force` aborts in-flight items, which the backend
    /// redelivers once their lease expires; otherwise waits for them.
    pub async fn close(&self, force: bool) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.send_replace(true);
        let workers = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for worker in workers {
            if force {
                worker.abort();
            }
            let _ = worker.await;
        }
        self.inner.finished.send_replace(true);
        debug!(channel = %self.inner.channel, force, "queue closed");
    }
}

async fn work_loop(inner: Arc<QueueInner>, handler: Arc<dyn JobHandler>, worker: usize) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut paused = inner.paused.subscribe();
    debug!(channel = %inner.channel, worker, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        if *paused.borrow() {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = paused.changed() => {}
            }
            continue;
        }

        let delivery = match inner
            .backend
            .pop(&inner.channel, inner.settings.lease)
            .await
        {
            Ok(delivery) => delivery,
            Err(e) => {
                inner.emit(QueueEvent::Error {
                    message: format!("pop failed: {e}"),
                });
                idle(&inner, &mut shutdown).await;
                continue;
            }
        };

        match delivery {
            Some(delivery) => run_job(&inner, &handler, delivery).await,
            None => idle(&inner, &mut shutdown).await,
        }
    }

    debug!(channel = %inner.channel, worker, "worker stopped");
}

async fn idle(inner: &QueueInner, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = shutdown.changed() => {}
        _ = inner.wake.notified() => {}
        _ = tokio::time::sleep(inner.settings.poll_interval) => {}
    }
}

async fn run_job(inner: &Arc<QueueInner>, handler: &Arc<dyn JobHandler>, delivery: Delivery) {
    let Delivery {
        id,
        attempt,
        envelope,
    } = delivery;
    let policy = envelope.opts;
    let span = start_job_span(&inner.channel, id, attempt);

    async {
        let needed = policy.timeout() + LEASE_MARGIN;
        if needed > inner.settings.lease {
            if let Err(e) = inner.backend.set_visibility(&inner.channel, id, needed).await {
                warn!(error = %e, "could not extend lease");
            }
        }

        inner.count(CounterKind::Total).await;
        inner.emit(QueueEvent::Active {
            job_id: id,
            attempt,
        });

        let ctx = JobContext::new(&inner.channel, id, attempt, inner.events.clone());
        let task = {
            let handler = Arc::clone(handler);
            tokio::spawn(async move { handler.handle(envelope.data, ctx).await })
        };
        let abort = task.abort_handle();
        let started = Instant::now();

        let outcome = match tokio::time::timeout(policy.timeout(), task).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join)) => Err(format!("handler panicked: {join}")),
            Err(_) => {
                abort.abort();
                inner.emit(QueueEvent::Stalled {
                    job_id: id,
                    attempt,
                });
                Err(format!("timed out after {}ms", policy.timeout_ms))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as f64;
        let outcome_label = if outcome.is_ok() { "completed" } else { "failed" };
        metrics::job_duration_ms().record(
            elapsed_ms,
            &[
                KeyValue::new("channel", inner.channel.clone()),
                KeyValue::new("outcome", outcome_label),
            ],
        );

        match outcome {
            Ok(result) => {
                inner.count(CounterKind::Success).await;
                if let Err(e) = inner
                    .backend
                    .ack(&inner.channel, id, policy.remove_on_complete)
                    .await
                {
                    inner.emit(QueueEvent::Error {
                        message: format!("ack of job {id} failed: {e}"),
                    });
                    return;
                }
                inner.emit(QueueEvent::Completed { job_id: id, result });
            }
            Err(error) if attempt >= policy.attempts => {
                info!(%error, attempt, "job failed permanently");
                inner.count(CounterKind::Failed).await;
                if let Err(e) = inner
                    .backend
                    .ack(&inner.channel, id, policy.remove_on_fail)
                    .await
                {
                    inner.emit(QueueEvent::Error {
                        message: format!("ack of job {id} failed: {e}"),
                    });
                    return;
                }
                inner.emit(QueueEvent::Failed {
                    job_id: id,
                    error,
                    attempts_made: attempt,
                });
            }
            Err(error) => {
                let delay = policy.backoff.delay_after(attempt);
                debug!(%error, attempt, delay_ms = delay.as_millis() as u64, "job will retry");
                if let Err(e) = inner.backend.set_visibility(&inner.channel, id, delay).await {
                    inner.emit(QueueEvent::Error {
                        message: format!("rescheduling job {id} failed: {e}"),
                    });
                }
            }
        }
    }
    .instrument(span)
    .await
}
