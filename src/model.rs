//! Core data model.
//!
//! A channel is a named batch of work. Its durable attributes live in the
//! shared registry; its items live in the queue engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Longest channel name accepted. Channel names double as pgmq queue names.
pub const MAX_CHANNEL_NAME_LEN: usize = 40;

/// Check that `name` is usable both as a registry field and a queue name.
pub fn validate_channel_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.len() > MAX_CHANNEL_NAME_LEN {
        "longer than 40 characters"
    } else if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        "only lowercase ASCII letters, digits and '_' are allowed"
    } else {
        return Ok(());
    };
    Err(Error::InvalidChannel {
        name: name.to_string(),
        reason,
    })
}

// ---------------------------------------------------------------------------
// Registry entry
// ---------------------------------------------------------------------------

/// Whether a channel may still receive input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Input may still arrive.
    #[default]
    Ready,
    /// No more input will be added; in-flight items may remain.
    Final,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelStatus::Ready => "ready",
            ChannelStatus::Final => "final",
        };
        write!(f, "{s}")
    }
}

/// Durable snapshot of a channel, stored as JSON under the channel name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl RegistryEntry {
    /// Entry written when a process first declares a channel.
    pub fn declared(now: DateTime<Utc>) -> Self {
        Self {
            status: ChannelStatus::Ready,
            started_at: Some(now),
        }
    }

    pub fn is_final(&self) -> bool {
        self.status == ChannelStatus::Final
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Per-channel item statistics. Never decremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Counters {
    /// Attempts started.
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    Total,
    Success,
    Failed,
}

impl CounterKind {
    pub const ALL: [CounterKind; 3] = [CounterKind::Total, CounterKind::Success, CounterKind::Failed];

    pub fn as_str(self) -> &'static str {
        match self {
            CounterKind::Total => "total",
            CounterKind::Success => "success",
            CounterKind::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CounterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Queue engine types
// ---------------------------------------------------------------------------

/// Identifier assigned to an item by the queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a channel queue's job counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
}

impl JobCounts {
    /// Nothing waiting, scheduled, or in flight.
    pub fn is_drained(&self) -> bool {
        self.waiting == 0 && self.delayed == 0 && self.active == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Delay between attempts of a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                self.delay_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Fully resolved resilience policy for one item. Travels with the item so
/// whichever process picks it up enforces the same policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPolicy {
    pub attempts: u32,
    pub timeout_ms: u64,
    pub backoff: Backoff,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl JobPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout_ms: 60_000,
            backoff: Backoff::fixed(Duration::from_secs(10)),
            remove_on_complete: true,
            remove_on_fail: true,
        }
    }
}

/// Per-call overrides for [`JobPolicy`]. Unset fields take the defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub attempts: Option<u32>,
    pub timeout: Option<Duration>,
    pub backoff: Option<Backoff>,
    pub remove_on_complete: Option<bool>,
    pub remove_on_fail: Option<bool>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(mut self, n: u32) -> Self {
        self.attempts = Some(n);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = Some(remove);
        self
    }

    pub fn remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = Some(remove);
        self
    }

    /// Overlay these options on `defaults`.
    pub fn resolve(&self, defaults: &JobPolicy) -> JobPolicy {
        JobPolicy {
            attempts: self.attempts.unwrap_or(defaults.attempts).max(1),
            timeout_ms: self
                .timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or(defaults.timeout_ms),
            backoff: self.backoff.unwrap_or(defaults.backoff),
            remove_on_complete: self.remove_on_complete.unwrap_or(defaults.remove_on_complete),
            remove_on_fail: self.remove_on_fail.unwrap_or(defaults.remove_on_fail),
        }
    }
}

/// What actually gets stored in the queue backend for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub data: serde_json::Value,
    pub opts: JobPolicy,
}

/// An item handed out by the backend to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: JobId,
    /// How many times this item has been handed out, including this one.
    pub attempt: u32,
    pub envelope: Envelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_are_validated() {
        assert!(validate_channel_name("import_run_42").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("has:colon").is_err());
        assert!(validate_channel_name("has space").is_err());
        assert!(validate_channel_name("Batch_1").is_err());
        assert!(validate_channel_name(&"x".repeat(41)).is_err());
    }

    #[test]
    fn options_overlay_defaults_field_by_field() {
        let defaults = JobPolicy::default();
        let policy = JobOptions::new()
            .attempts(5)
            .remove_on_fail(false)
            .resolve(&defaults);
        assert_eq!(policy.attempts, 5);
        assert!(!policy.remove_on_fail);
        assert_eq!(policy.timeout_ms, defaults.timeout_ms);
        assert_eq!(policy.backoff, defaults.backoff);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let policy = JobOptions::new().attempts(0).resolve(&JobPolicy::default());
        assert_eq!(policy.attempts, 1);
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay_after(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_after(3), Duration::from_millis(400));
        let fixed = Backoff::fixed(Duration::from_millis(100));
        assert_eq!(fixed.delay_after(3), Duration::from_millis(100));
    }

    #[test]
    fn entry_reads_legacy_shapes() {
        let entry: RegistryEntry = serde_json::from_str(r#"{"status":"final"}"#).unwrap();
        assert!(entry.is_final());
        assert!(entry.started_at.is_none());

        let entry: RegistryEntry = serde_json::from_str("{}").unwrap();
        assert_eq!(entry.status, ChannelStatus::Ready);
    }
}
