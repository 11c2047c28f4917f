//! Fatal-condition supervision.
//!
//! Queue errors and failed handshakes are reported here instead of being
//! swallowed. The policy decides what happens next: stop the whole process,
//! or drop the affected channel's local handle so the next tick rebuilds it.

use std::fmt;
use std::str::FromStr;

use tokio::sync::mpsc;
use tracing::{error, warn};

use super::Fabric;
use crate::error::{Error, Result};

/// What to do when a channel reports a fatal condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FatalPolicy {
    /// Stop everything and surface the error to the caller.
    #[default]
    Exit,
    /// Tear down the channel locally and let reconciliation recreate it.
    Restart,
}

impl fmt::Display for FatalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalPolicy::Exit => write!(f, "exit"),
            FatalPolicy::Restart => write!(f, "restart"),
        }
    }
}

impl FromStr for FatalPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exit" => Ok(FatalPolicy::Exit),
            "restart" => Ok(FatalPolicy::Restart),
            other => Err(format!("unknown fatal policy {other:?}, expected exit or restart")),
        }
    }
}

/// A fatal condition reported by one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fatal {
    pub channel: String,
    pub message: String,
}

pub struct Supervisor {
    fabric: Fabric,
    policy: FatalPolicy,
    reports: mpsc::UnboundedReceiver<Fatal>,
}

impl Supervisor {
    /// Claim the fabric's fatal reports. Fails if something already took them.
    pub fn new(fabric: &Fabric, policy: FatalPolicy) -> Result<Self> {
        let reports = fabric
            .take_fatal_reports()
            .ok_or_else(|| Error::Engine("fatal reports already claimed".to_string()))?;
        Ok(Self {
            fabric: fabric.clone(),
            policy,
            reports,
        })
    }

    /// Handle reports. Under [`FatalPolicy::Restart`] this never returns;
    /// under [`FatalPolicy::Exit`] the first report force-stops the fabric
    /// and is returned as [`Error::Fatal`].
    pub async fn run(mut self) -> Result<()> {
        while let Some(fatal) = self.reports.recv().await {
            match self.policy {
                FatalPolicy::Exit => {
                    error!(channel = %fatal.channel, message = %fatal.message, "fatal condition, stopping");
                    self.fabric.stop(true).await;
                    return Err(Error::Fatal {
                        channel: fatal.channel,
                        message: fatal.message,
                    });
                }
                FatalPolicy::Restart => {
                    warn!(channel = %fatal.channel, message = %fatal.message, "fatal condition, restarting channel");
                    self.fabric.teardown(&fatal.channel, false).await;
                }
            }
        }
        Ok(())
    }
}
