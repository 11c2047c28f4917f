//! # channel-fabric
//!
//! Distributed coordination of named job channels over a shared registry.
//!
//! Any number of processes point at the same registry namespace and queue
//! backend. A channel is declared with [`Fabric::ready`], fed with
//! [`Fabric::add`], and closed with [`Fabric::finalize`]; every process
//! reconciles its local queue handles against the registry on a fixed tick,
//! and exactly one process emits `done` once a closed channel has drained.
//!
//! Postgres backs both halves in production (a field table for the registry,
//! pgmq for the queues). In-memory backends stand in for tests.

pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod fabric;
pub mod model;
pub mod queue;
pub mod registry;
pub mod telemetry;

pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use fabric::Fabric;
