//! Reconciliation loop.
//!
//! Each tick compares the registry with this process's local handles:
//! channels gone from the registry are torn down and purged, channels this
//! process has not seen yet get a handle. Final channels that are still
//! local get a completion check, which covers channels that drained before
//! their input was closed by another process.

use std::collections::BTreeSet;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, warn};

use super::{Fabric, completion};
use crate::error::Result;
use crate::telemetry::channel::{record_tick_result, start_tick_span};
use crate::telemetry::metrics;

/// What one tick changed locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub torn_down: Vec<String>,
    pub started: Vec<String>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.torn_down.is_empty() && self.started.is_empty()
    }
}

impl Fabric {
    /// Run one reconciliation pass.
    ///
    /// A registry read failure aborts the pass with no local changes.
    pub async fn tick(&self) -> Result<TickReport> {
        let span = start_tick_span(&self.inner.process_id.to_string());
        let result = self.reconcile().instrument(span.clone()).await;

        let label = match &result {
            Ok(report) => {
                record_tick_result(&span, report.started.len(), report.torn_down.len());
                "ok"
            }
            Err(e) => {
                warn!(error = %e, "reconciliation skipped, registry unavailable");
                "error"
            }
        };
        metrics::reconcile_ticks().add(1, &[KeyValue::new("result", label)]);
        result
    }

    async fn reconcile(&self) -> Result<TickReport> {
        let entries = self.inner.registry.get_all().await?;
        let mut report = TickReport::default();

        let (stale, final_local) = {
            let handles = self.inner.handles.lock().await;
            let stale: Vec<String> = handles
                .iter()
                .filter(|(name, handle)| handle.confirmed && !entries.contains_key(*name))
                .map(|(name, _)| name.clone())
                .collect();
            let final_local: Vec<(String, _)> = handles
                .iter()
                .filter(|(name, _)| {
                    matches!(entries.get(*name), Some(Some(entry)) if entry.is_final())
                })
                .map(|(name, handle)| (name.clone(), handle.queue.clone()))
                .collect();
            (stale, final_local)
        };

        for channel in stale {
            if self.teardown(&channel, true).await {
                report.torn_down.push(channel);
            }
        }

        let local: BTreeSet<String> = self.local_channels().await.into_iter().collect();
        for channel in entries.keys().filter(|name| !local.contains(*name)) {
            match self.ready_with(channel, false).await {
                Ok(true) => report.started.push(channel.clone()),
                Ok(false) => {}
                Err(e) => warn!(channel = %channel, error = %e, "could not start channel"),
            }
        }

        for (channel, queue) in final_local {
            completion::check(self, &channel, &queue).await;
        }

        if !report.is_empty() {
            info!(
                started = report.started.len(),
                torn_down = report.torn_down.len(),
                "reconciled"
            );
        }
        Ok(report)
    }

    /// Tick every `tick_interval` until [`Fabric::shutdown`]. The first tick
    /// runs immediately. Returns at once on a fabric that was shut down and
    /// not started again.
    pub async fn run(&self) {
        let mut stop = self.inner.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.inner.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(
            every_ms = self.inner.config.tick_interval.as_millis() as u64,
            "reconciliation loop started"
        );

        loop {
            tokio::select! {
                _ = async { stop.wait_for(|stopped| *stopped).await.map(|_| ()) } => break,
                _ = interval.tick() => {
                    // Failures are logged and retried next tick.
                    let _ = self.tick().await;
                }
            }
        }
        debug!("reconciliation loop stopped");
    }

    /// Spawn [`Fabric::run`] in the background. Calling it twice is a noop.
    pub fn start(&self) {
        let mut ticker = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if ticker.is_some() {
            return;
        }
        self.inner.shutdown.send_replace(false);
        let fabric = self.clone();
        *ticker = Some(tokio::spawn(async move { fabric.run().await }));
    }

    /// Stop reconciling and close every local channel, letting in-flight
    /// items finish. Registry entries are left for other processes.
    pub async fn shutdown(&self) {
        self.stop(false).await;
    }

    pub(crate) async fn stop(&self, force: bool) {
        self.inner.shutdown.send_replace(true);
        let ticker = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(ticker) = ticker {
            if force {
                ticker.abort();
            }
            let _ = tokio::time::timeout(Duration::from_secs(30), ticker).await;
        }

        let handles: Vec<_> = self.inner.handles.lock().await.drain().collect();
        for (channel, handle) in handles {
            handle.queue.close(force).await;
            debug!(channel = %channel, "channel closed");
        }
        info!(force, "fabric stopped");
    }
}
