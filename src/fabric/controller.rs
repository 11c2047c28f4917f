//! Channel controller: `ready`, `add`, `finalize`, and local teardown.

use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::relay::{self, RegistryTally};
use super::{Fabric, LocalHandle, completion};
use crate::error::{Error, Result};
use crate::model::{ChannelStatus, JobId, JobOptions, RegistryEntry, validate_channel_name};
use crate::queue::ChannelQueue;
use crate::telemetry::metrics;

impl Fabric {
    /// Declare `channel` active and start processing it in this process.
    ///
    /// Idempotent: a channel that already has a local handle is left alone.
    pub async fn ready(&self, channel: &str) -> Result<()> {
        self.ready_with(channel, true).await.map(|_| ())
    }

    /// Create the local handle for `channel` unless one exists. `declared`
    /// writes a fresh registry entry; reconciliation passes `false` because
    /// the entry already exists. Returns whether a handle was created.
    pub(crate) async fn ready_with(&self, channel: &str, declared: bool) -> Result<bool> {
        validate_channel_name(channel)?;

        let queue = {
            let mut handles = self.inner.handles.lock().await;
            if handles.contains_key(channel) {
                debug!(channel, "channel already active locally");
                return Ok(false);
            }
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let queue = ChannelQueue::open_counted(
                channel,
                self.inner.backend.clone(),
                events_tx,
                self.queue_settings(),
                Arc::new(RegistryTally(self.inner.registry.clone())),
            );
            relay::spawn(self.clone(), channel.to_string(), queue.clone(), events_rx);
            handles.insert(
                channel.to_string(),
                LocalHandle {
                    queue: queue.clone(),
                    started_at: Utc::now(),
                    last_add: None,
                    confirmed: !declared,
                },
            );
            queue
        };

        if declared {
            if let Err(e) = self
                .inner
                .registry
                .declare(channel, &RegistryEntry::declared(Utc::now()))
                .await
            {
                warn!(channel, error = %e, "could not declare channel");
                self.teardown(channel, false).await;
                return Err(e);
            }
            if let Some(handle) = self.inner.handles.lock().await.get_mut(channel) {
                handle.confirmed = true;
            }
        }

        let handshake = tokio::time::timeout(self.inner.config.connect_timeout, queue.ready()).await;
        let failure = match handshake {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "no connection within {}ms",
                self.inner.config.connect_timeout.as_millis()
            )),
        };
        if let Some(message) = failure {
            self.teardown(channel, false).await;
            self.report_fatal(channel, message.clone());
            return Err(Error::Engine(format!("channel {channel} failed to connect: {message}")));
        }

        queue.process(self.inner.config.concurrency, self.inner.handler.clone());

        metrics::channel_lifecycle().add(
            1,
            &[
                KeyValue::new("action", "started"),
                KeyValue::new("declared", declared),
            ],
        );
        info!(channel, declared, "channel ready");
        Ok(true)
    }

    /// Enqueue `item` on a locally-active channel.
    ///
    /// Fails with [`Error::ChannelNotActive`] when this process has no handle
    /// for the channel; it never creates one.
    pub async fn add(
        &self,
        channel: &str,
        item: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        let queue = {
            let mut handles = self.inner.handles.lock().await;
            let handle = handles
                .get_mut(channel)
                .ok_or_else(|| Error::ChannelNotActive(channel.to_string()))?;
            handle.last_add = Some(Utc::now());
            handle.queue.clone()
        };

        let id = queue.add(item, options).await?;
        metrics::items_added().add(1, &[KeyValue::new("channel", channel.to_string())]);
        debug!(channel, job_id = %id, "item added");
        Ok(id)
    }

    /// Close a channel's input. It completes once its queue drains.
    ///
    /// Fails with [`Error::ChannelNotActive`] when the registry has no entry,
    /// so a finished channel is never resurrected.
    pub async fn finalize(&self, channel: &str) -> Result<()> {
        validate_channel_name(channel)?;
        if self.inner.registry.get(channel).await?.is_none() {
            return Err(Error::ChannelNotActive(channel.to_string()));
        }
        self.inner
            .registry
            .set_status(channel, ChannelStatus::Final)
            .await?;
        info!(channel, "channel input closed");

        // Everything may have finished already, in which case no further
        // terminal event would trigger the check.
        if let Some(queue) = self.local_queue(channel).await {
            completion::check(self, channel, &queue).await;
        }
        Ok(())
    }

    /// Run the completion detector for a locally-active channel now.
    pub async fn check_completion(&self, channel: &str) -> Result<completion::CompletionCheck> {
        let queue = self
            .local_queue(channel)
            .await
            .ok_or_else(|| Error::ChannelNotActive(channel.to_string()))?;
        Ok(completion::check(self, channel, &queue).await)
    }

    /// Drop the local handle for `channel`. `purge` also empties the
    /// channel's queue, which is only right once the channel is gone from
    /// the registry. Returns whether a handle existed.
    pub(crate) async fn teardown(&self, channel: &str, purge: bool) -> bool {
        let Some(handle) = self.inner.handles.lock().await.remove(channel) else {
            return false;
        };
        if purge {
            if let Err(e) = handle.queue.empty().await {
                warn!(channel, error = %e, "could not empty queue during teardown");
            }
        }
        handle.queue.close(true).await;

        metrics::channel_lifecycle().add(1, &[KeyValue::new("action", "torn_down")]);
        info!(
            channel,
            purge,
            active_for_ms = (Utc::now() - handle.started_at).num_milliseconds(),
            "channel torn down"
        );
        true
    }
}
