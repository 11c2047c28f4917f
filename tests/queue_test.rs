//! Tests for a single channel queue, without the registry on top.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use channel_fabric::model::{Backoff, CounterKind, JobCounts, JobOptions, JobPolicy};
use channel_fabric::queue::{
    ChannelQueue, CommandHandler, JobBackend, JobHandler, MemoryBackend, QueueEvent, QueueSettings,
    Tally, handler_fn,
};
use serde_json::json;
use tokio::sync::{Mutex, mpsc};

fn settings() -> QueueSettings {
    QueueSettings {
        poll_interval: Duration::from_millis(10),
        lease: Duration::from_secs(30),
        defaults: JobPolicy {
            attempts: 1,
            timeout_ms: 5_000,
            backoff: Backoff::fixed(Duration::from_millis(10)),
            ..JobPolicy::default()
        },
    }
}

async fn open(
    backend: &MemoryBackend,
    channel: &str,
) -> (ChannelQueue, mpsc::UnboundedReceiver<QueueEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = ChannelQueue::open(channel, Arc::new(backend.clone()), tx, settings());
    queue.ready().await.unwrap();
    (queue, rx)
}

async fn next(
    rx: &mut mpsc::UnboundedReceiver<QueueEvent>,
    mut pred: impl FnMut(&QueueEvent) -> bool,
) -> QueueEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("queue event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for queue event")
}

fn noop() -> Arc<dyn JobHandler> {
    handler_fn(|_, _| async { Ok(json!(null)) })
}

#[tokio::test]
async fn ready_creates_the_queue_and_emits_ready() {
    let backend = MemoryBackend::new();
    let (queue, mut rx) = open(&backend, "batch_1").await;

    assert_eq!(rx.recv().await, Some(QueueEvent::Ready));
    assert_eq!(queue.channel(), "batch_1");
    assert!(queue.job_counts().await.unwrap().is_drained());
}

#[tokio::test]
async fn pause_holds_items_until_resumed() {
    let backend = MemoryBackend::new();
    let (queue, mut rx) = open(&backend, "batch_1").await;
    queue.pause();
    queue.process(1, noop());

    queue.add(json!(1), JobOptions::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.job_counts().await.unwrap().waiting, 1);

    queue.resume();
    next(&mut rx, |e| matches!(e, QueueEvent::Completed { .. })).await;

    queue.close(false).await;
    assert!(queue.is_closed());
}

#[tokio::test]
async fn pause_and_resume_emit_events() {
    let backend = MemoryBackend::new();
    let (queue, mut rx) = open(&backend, "batch_1").await;

    queue.pause();
    queue.pause();
    queue.resume();
    queue.resume();

    assert_eq!(rx.recv().await, Some(QueueEvent::Ready));
    assert_eq!(rx.recv().await, Some(QueueEvent::Paused));
    assert_eq!(rx.recv().await, Some(QueueEvent::Resumed));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn empty_removes_waiting_items() {
    let backend = MemoryBackend::new();
    let (queue, mut rx) = open(&backend, "batch_1").await;

    for n in 0..3 {
        queue.add(json!(n), JobOptions::new()).await.unwrap();
    }
    assert_eq!(queue.empty().await.unwrap(), 3);
    assert!(queue.job_counts().await.unwrap().is_drained());

    next(&mut rx, |e| matches!(e, QueueEvent::Cleaned { removed: 3 })).await;
}

#[tokio::test]
async fn closed_queue_rejects_items() {
    let backend = MemoryBackend::new();
    let (queue, _rx) = open(&backend, "batch_1").await;

    queue.close(true).await;
    assert!(queue.add(json!(1), JobOptions::new()).await.is_err());
}

#[tokio::test]
async fn graceful_close_waits_for_in_flight_items() {
    let backend = MemoryBackend::new();
    let (queue, mut rx) = open(&backend, "batch_1").await;
    queue.process(
        1,
        handler_fn(|_, _| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("slow"))
        }),
    );

    queue.add(json!(1), JobOptions::new()).await.unwrap();
    next(&mut rx, |e| matches!(e, QueueEvent::Active { .. })).await;
    queue.close(false).await;

    let completed = rx.try_recv();
    assert!(
        matches!(completed, Ok(QueueEvent::Completed { ref result, .. }) if *result == json!("slow")),
        "{completed:?}"
    );
}

#[tokio::test]
async fn backend_errors_are_reported() {
    let backend = MemoryBackend::new();
    let (queue, mut rx) = open(&backend, "batch_1").await;
    backend.set_disconnected(true);
    queue.process(1, noop());

    next(&mut rx, |e| matches!(e, QueueEvent::Error { .. })).await;
    queue.close(true).await;
}

#[tokio::test]
async fn exponential_backoff_retries_until_success() {
    let backend = MemoryBackend::new();
    let (queue, mut rx) = open(&backend, "batch_1").await;
    queue.process(
        1,
        handler_fn(|_, ctx| async move {
            if ctx.attempt < 3 {
                Err("not yet".into())
            } else {
                Ok(json!(ctx.attempt))
            }
        }),
    );

    queue
        .add(
            json!({}),
            JobOptions::new()
                .attempts(3)
                .backoff(Backoff::exponential(Duration::from_millis(5))),
        )
        .await
        .unwrap();

    let mut attempts = Vec::new();
    let done = next(&mut rx, |e| {
        if let QueueEvent::Active { attempt, .. } = e {
            attempts.push(*attempt);
        }
        matches!(e, QueueEvent::Completed { .. })
    })
    .await;
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(matches!(done, QueueEvent::Completed { result, .. } if result == json!(3)));

    queue.close(true).await;
}

/// Records each counter update with the backend's counts at that moment.
struct Snapshots {
    backend: MemoryBackend,
    seen: Mutex<Vec<(CounterKind, JobCounts)>>,
}

#[async_trait]
impl Tally for Snapshots {
    async fn count(&self, channel: &str, kind: CounterKind) {
        let counts = self.backend.counts(channel).await.unwrap();
        self.seen.lock().await.push((kind, counts));
    }
}

#[tokio::test]
async fn outcomes_are_counted_while_the_item_is_held() {
    let backend = MemoryBackend::new();
    let tally = Arc::new(Snapshots {
        backend: backend.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let queue = ChannelQueue::open_counted(
        "batch_1",
        Arc::new(backend.clone()),
        tx,
        settings(),
        tally.clone(),
    );
    queue.ready().await.unwrap();
    queue.process(
        2,
        handler_fn(|data, _| async move {
            if data == json!("bad") {
                Err("rejected".into())
            } else {
                Ok(data)
            }
        }),
    );

    queue.add(json!("good"), JobOptions::new()).await.unwrap();
    queue.add(json!("bad"), JobOptions::new()).await.unwrap();
    let mut finished = 0;
    next(&mut rx, |e| {
        if matches!(e, QueueEvent::Completed { .. } | QueueEvent::Failed { .. }) {
            finished += 1;
        }
        finished == 2
    })
    .await;
    queue.close(false).await;

    let seen = tally.seen.lock().await;
    let kinds: Vec<CounterKind> = seen.iter().map(|(kind, _)| *kind).collect();
    assert_eq!(kinds.iter().filter(|k| **k == CounterKind::Total).count(), 2);
    assert!(kinds.contains(&CounterKind::Success));
    assert!(kinds.contains(&CounterKind::Failed));
    for (kind, counts) in seen.iter() {
        assert!(counts.active >= 1, "{kind:?} counted after release: {counts:?}");
    }
}

#[cfg(unix)]
#[tokio::test]
async fn command_handler_round_trips_json() {
    let backend = MemoryBackend::new();
    let (queue, mut rx) = open(&backend, "batch_1").await;
    let cat = CommandHandler::new(std::path::Path::new("/bin/cat")).unwrap();
    queue.process(1, Arc::new(cat));

    queue
        .add(json!({"file": "a.csv", "rows": 12}), JobOptions::new())
        .await
        .unwrap();

    let event = next(&mut rx, |e| {
        matches!(e, QueueEvent::Completed { .. } | QueueEvent::Failed { .. })
    })
    .await;
    match event {
        QueueEvent::Completed { result, .. } => {
            assert_eq!(result, json!({"file": "a.csv", "rows": 12}))
        }
        other => panic!("expected completed, got {other:?}"),
    }

    queue.close(true).await;
}

#[cfg(unix)]
#[tokio::test]
async fn command_handler_fails_on_nonzero_exit() {
    let backend = MemoryBackend::new();
    let (queue, mut rx) = open(&backend, "batch_1").await;
    let fail = CommandHandler::new(std::path::Path::new("/bin/false")).unwrap();
    queue.process(1, Arc::new(fail));

    queue.add(json!({}), JobOptions::new()).await.unwrap();

    let event = next(&mut rx, |e| {
        matches!(e, QueueEvent::Completed { .. } | QueueEvent::Failed { .. })
    })
    .await;
    match event {
        QueueEvent::Failed { attempts_made, .. } => assert_eq!(attempts_made, 1),
        other => panic!("expected failed, got {other:?}"),
    }

    queue.close(true).await;
}
