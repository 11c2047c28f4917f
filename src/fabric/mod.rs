//! The coordination engine: channel controller, event relay, completion
//! detector, reconciliation loop, and supervision of fatal conditions.
//!
//! Every process builds one [`Fabric`] over the same registry namespace and
//! queue backend. The registry decides which channels exist; each process
//! keeps at most one local queue handle per channel and converges on the
//! registry once per tick.

pub mod completion;
pub mod controller;
pub mod reconcile;
pub mod relay;
pub mod supervisor;

pub use completion::CompletionCheck;
pub use reconcile::TickReport;
pub use supervisor::{Fatal, FatalPolicy, Supervisor};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::error;
use uuid::Uuid;

use crate::config::FabricConfig;
use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::queue::channel::LEASE_MARGIN;
use crate::queue::{ChannelQueue, JobBackend, JobHandler, QueueSettings};
use crate::registry::{HashStore, SharedRegistry};

/// Buffered events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// A channel this process is currently participating in.
pub(crate) struct LocalHandle {
    pub(crate) queue: ChannelQueue,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) last_add: Option<DateTime<Utc>>,
    /// False while a locally-declared channel's registry entry is still
    /// being written; reconciliation must not treat it as stale yet.
    pub(crate) confirmed: bool,
}

pub(crate) struct Inner {
    pub(crate) process_id: Uuid,
    pub(crate) config: FabricConfig,
    pub(crate) registry: SharedRegistry,
    pub(crate) backend: Arc<dyn JobBackend>,
    pub(crate) handler: Arc<dyn JobHandler>,
    pub(crate) handles: Mutex<HashMap<String, LocalHandle>>,
    events: broadcast::Sender<Event>,
    seq: AtomicU64,
    fatal_tx: mpsc::UnboundedSender<Fatal>,
    fatal_rx: StdMutex<Option<mpsc::UnboundedReceiver<Fatal>>>,
    /// Raised by `stop`, lowered again by `start`.
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) ticker: StdMutex<Option<JoinHandle<()>>>,
}

/// One process's view of the shared channel fabric. Cheap to clone.
#[derive(Clone)]
pub struct Fabric {
    pub(crate) inner: Arc<Inner>,
}

impl Fabric {
    /// Build a fabric. Nothing runs until [`Fabric::ready`], [`Fabric::tick`]
    /// or [`Fabric::start`] is called.
    pub fn new(
        config: FabricConfig,
        store: Arc<dyn HashStore>,
        backend: Arc<dyn JobBackend>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let registry = SharedRegistry::new(store, config.namespace.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                process_id: Uuid::new_v4(),
                config,
                registry,
                backend,
                handler,
                handles: Mutex::new(HashMap::new()),
                events,
                seq: AtomicU64::new(0),
                fatal_tx,
                fatal_rx: StdMutex::new(Some(fatal_rx)),
                shutdown: watch::channel(false).0,
                ticker: StdMutex::new(None),
            }),
        })
    }

    pub fn process_id(&self) -> Uuid {
        self.inner.process_id
    }

    pub fn config(&self) -> &FabricConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.inner.registry
    }

    /// Subscribe to the process-wide event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Take the stream of fatal reports. Only the first caller gets it;
    /// [`Supervisor::new`] normally does.
    pub fn take_fatal_reports(&self) -> Option<mpsc::UnboundedReceiver<Fatal>> {
        self.inner
            .fatal_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Names of channels with a local handle, sorted.
    pub async fn local_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.handles.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_local(&self, channel: &str) -> bool {
        self.inner.handles.lock().await.contains_key(channel)
    }

    /// When this process last enqueued an item for `channel`.
    pub async fn last_added(&self, channel: &str) -> Option<DateTime<Utc>> {
        self.inner
            .handles
            .lock()
            .await
            .get(channel)
            .and_then(|handle| handle.last_add)
    }

    pub(crate) async fn local_queue(&self, channel: &str) -> Option<ChannelQueue> {
        self.inner
            .handles
            .lock()
            .await
            .get(channel)
            .map(|handle| handle.queue.clone())
    }

    pub(crate) fn queue_settings(&self) -> QueueSettings {
        let defaults = self.inner.config.job_defaults;
        QueueSettings {
            poll_interval: self.inner.config.poll_interval,
            lease: defaults.timeout() + LEASE_MARGIN,
            defaults,
        }
    }

    pub(crate) fn emit(&self, channel: &str, kind: EventKind) {
        let event = Event {
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            channel: channel.to_string(),
            kind,
        };
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn report_fatal(&self, channel: &str, message: String) {
        error!(channel, %message, "fatal queue condition");
        let _ = self.inner.fatal_tx.send(Fatal {
            channel: channel.to_string(),
            message,
        });
    }
}
