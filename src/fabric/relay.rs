//! Event relay: one task per local channel.
//!
//! Re-emits every queue event on the process-wide stream tagged with the
//! channel, then applies its side effects. Events of one channel are handled
//! strictly in order, so completion checks never overlap within a process.
//! Terminal events already buffered are relayed before the check runs.
//! The relay drains what is left and exits once the queue has closed.
//!
//! Counters are not touched here: workers update them through
//! [`RegistryTally`] before acking, so they are complete by the time any
//! process can observe the queue drained.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Fabric, completion};
use crate::event::EventKind;
use crate::model::CounterKind;
use crate::queue::{ChannelQueue, QueueEvent, Tally};
use crate::registry::SharedRegistry;
use crate::telemetry::metrics;

/// Writes worker-side counter updates into the shared registry.
pub(crate) struct RegistryTally(pub(crate) SharedRegistry);

#[async_trait]
impl Tally for RegistryTally {
    async fn count(&self, channel: &str, kind: CounterKind) {
        if let Err(e) = self.0.increment_counter(channel, kind).await {
            warn!(channel, counter = %kind, error = %e, "counter increment lost");
        }
    }
}

pub(crate) fn spawn(
    fabric: Fabric,
    channel: String,
    queue: ChannelQueue,
    mut events: mpsc::UnboundedReceiver<QueueEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => {
                        let terminal = relay_one(&fabric, &channel, event);
                        catch_up(&fabric, &channel, &queue, &mut events, terminal).await;
                    }
                    None => break,
                },
                _ = queue.finished() => {
                    catch_up(&fabric, &channel, &queue, &mut events, false).await;
                    break;
                }
            }
        }
        debug!(channel, "relay finished");
    })
}

/// Relay everything already buffered, then run one completion check if any
/// relayed event finished an item. `done` thus follows every terminal event
/// this process has reported for the channel.
async fn catch_up(
    fabric: &Fabric,
    channel: &str,
    queue: &ChannelQueue,
    events: &mut mpsc::UnboundedReceiver<QueueEvent>,
    mut terminal: bool,
) {
    while let Ok(event) = events.try_recv() {
        terminal |= relay_one(fabric, channel, event);
    }
    if terminal {
        completion::check(fabric, channel, queue).await;
    }
}

/// Emit one event and apply its side effects. Returns whether it finished
/// an item.
fn relay_one(fabric: &Fabric, channel: &str, event: QueueEvent) -> bool {
    fabric.emit(channel, EventKind::from(event.clone()));

    match event {
        QueueEvent::Error { message } => fabric.report_fatal(channel, message),
        QueueEvent::Active { .. } => record_outcome(channel, "active"),
        QueueEvent::Stalled { .. } => record_outcome(channel, "stalled"),
        QueueEvent::Completed { .. } => {
            record_outcome(channel, "completed");
            return true;
        }
        QueueEvent::Failed { .. } => {
            record_outcome(channel, "failed");
            return true;
        }
        _ => {}
    }
    false
}

fn record_outcome(channel: &str, outcome: &'static str) {
    metrics::item_outcomes().add(
        1,
        &[
            KeyValue::new("channel", channel.to_string()),
            KeyValue::new("outcome", outcome),
        ],
    );
}
