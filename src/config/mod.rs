//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or any
//! value does not parse. Sensitive values are wrapped in
//! `secrecy::SecretString` to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use crate::fabric::FatalPolicy;
use crate::model::{Backoff, JobPolicy};
use crate::registry::DEFAULT_NAMESPACE;
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

/// Process configuration.
#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub fabric: FabricConfig,
}

/// Settings the fabric itself consumes. Nothing secret lives here.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Registry hash namespace shared by every cooperating process.
    pub namespace: String,
    /// Handler workers per channel. Zero runs producer-only.
    pub concurrency: usize,
    pub tick_interval: Duration,
    /// Upper bound on the queue connection handshake during `ready`.
    pub connect_timeout: Duration,
    /// Worker sleep when a channel's queue is empty.
    pub poll_interval: Duration,
    /// Policy for items added without explicit options.
    pub job_defaults: JobPolicy,
    pub fatal_policy: FatalPolicy,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            concurrency: 5,
            tick_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            job_defaults: JobPolicy::default(),
            fatal_policy: FatalPolicy::Exit,
        }
    }
}

impl FabricConfig {
    /// Reject settings the fabric cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Config("namespace must not be empty".to_string()));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::Config("tick interval must be positive".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect timeout must be positive".to_string()));
        }
        if self.job_defaults.attempts == 0 {
            return Err(Error::Config("job attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let defaults = FabricConfig::default();
        let job = defaults.job_defaults;

        let concurrency: usize = optional_var("FABRIC_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(Error::Config(
                "FABRIC_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let fabric = FabricConfig {
            namespace: optional_var("FABRIC_NAMESPACE", defaults.namespace)?,
            concurrency,
            tick_interval: millis_var("FABRIC_TICK_INTERVAL_MS", defaults.tick_interval)?,
            connect_timeout: millis_var("FABRIC_CONNECT_TIMEOUT_MS", defaults.connect_timeout)?,
            poll_interval: millis_var("FABRIC_POLL_INTERVAL_MS", defaults.poll_interval)?,
            job_defaults: JobPolicy {
                attempts: optional_var("FABRIC_JOB_ATTEMPTS", job.attempts)?,
                timeout_ms: optional_var("FABRIC_JOB_TIMEOUT_MS", job.timeout_ms)?,
                backoff: Backoff::fixed(millis_var(
                    "FABRIC_JOB_BACKOFF_MS",
                    Duration::from_millis(job.backoff.delay_ms),
                )?),
                ..job
            },
            fatal_policy: optional_var("FABRIC_FATAL_POLICY", defaults.fatal_policy)?,
        };
        fabric.validate()?;

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            fabric,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    optional_var(name, default.as_millis() as u64).map(Duration::from_millis)
}
