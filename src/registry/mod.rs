//! Shared registry of active channels.
//!
//! The registry is a single hash, keyed by a fixed namespace, holding one
//! JSON field per channel plus three counter fields per channel
//! (`"<channel>:total"`, `"<channel>:success"`, `"<channel>:failed"`).
//!
//! Consistency contract: the backing transport gives no isolation across
//! callers. `set_or_merge` is read-merge-write and last-writer-wins per
//! field, so callers only merge idempotent fields (status, timestamps).
//! Counters never go through the merge path; they use the transport's
//! atomic increment.

pub mod memory;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{ChannelStatus, CounterKind, Counters, RegistryEntry};

pub use memory::MemoryHashStore;

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "running_task_info";

const COUNTER_SEPARATOR: char = ':';

/// Hash-map transport underneath the registry.
///
/// Every call is a separate round trip. Only `hincrby`, `hdel` and `hmget`
/// are individually atomic; nothing spans calls.
#[async_trait]
pub trait HashStore: Send + Sync {
    async fn hgetall(&self, namespace: &str) -> Result<HashMap<String, String>>;

    async fn hget(&self, namespace: &str, field: &str) -> Result<Option<String>>;

    async fn hset(&self, namespace: &str, field: &str, value: &str) -> Result<()>;

    /// Delete `fields`, returning the ones that existed.
    async fn hdel(&self, namespace: &str, fields: &[String]) -> Result<Vec<String>>;

    /// Atomically add `by` to an integer field (missing = 0), returning the new value.
    async fn hincrby(&self, namespace: &str, field: &str, by: i64) -> Result<i64>;

    /// Read several fields in one consistent snapshot.
    async fn hmget(&self, namespace: &str, fields: &[String]) -> Result<Vec<Option<String>>>;
}

fn counter_field(channel: &str, kind: CounterKind) -> String {
    format!("{channel}{COUNTER_SEPARATOR}{kind}")
}

fn counter_fields(channel: &str) -> Vec<String> {
    CounterKind::ALL
        .iter()
        .map(|kind| counter_field(channel, *kind))
        .collect()
}

fn is_counter_field(field: &str) -> bool {
    field.contains(COUNTER_SEPARATOR)
}

fn parse_entry(channel: &str, raw: &str) -> Option<RegistryEntry> {
    match serde_json::from_str(raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(channel, error = %e, "unreadable registry entry, treating as absent");
            None
        }
    }
}

/// Typed access to channel entries and counters.
#[derive(Clone)]
pub struct SharedRegistry {
    store: Arc<dyn HashStore>,
    namespace: String,
}

impl SharedRegistry {
    pub fn new(store: Arc<dyn HashStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Every channel in the registry. Entries that fail to deserialize are
    /// present with `None`.
    pub async fn get_all(&self) -> Result<BTreeMap<String, Option<RegistryEntry>>> {
        let raw = self.store.hgetall(&self.namespace).await?;
        Ok(raw
            .into_iter()
            .filter(|(field, _)| !is_counter_field(field))
            .map(|(field, value)| {
                let entry = parse_entry(&field, &value);
                (field, entry)
            })
            .collect())
    }

    pub async fn get(&self, channel: &str) -> Result<Option<RegistryEntry>> {
        let raw = self.store.hget(&self.namespace, channel).await?;
        Ok(raw.and_then(|raw| parse_entry(channel, &raw)))
    }

    /// Shallow-merge `patch` over the stored entry and write it back.
    pub async fn set_or_merge(&self, channel: &str, patch: Map<String, Value>) -> Result<()> {
        let existing = self.store.hget(&self.namespace, channel).await?;
        let mut merged = match existing.as_deref().map(serde_json::from_str::<Value>) {
            Some(Ok(Value::Object(map))) => map,
            Some(Ok(other)) => {
                warn!(channel, found = %other, "registry entry is not an object, replacing");
                Map::new()
            }
            Some(Err(e)) => {
                warn!(channel, error = %e, "unreadable registry entry, replacing");
                Map::new()
            }
            None => Map::new(),
        };
        merged.extend(patch);
        let raw = serde_json::to_string(&Value::Object(merged))?;
        self.store.hset(&self.namespace, channel, &raw).await?;
        debug!(channel, "registry entry merged");
        Ok(())
    }

    /// Write a fresh `{status: ready, startedAt}` entry.
    ///
    /// When no entry exists, counters left behind under the same name are
    /// cleared first so the new channel starts from zero. Declaring a channel
    /// that is still listed keeps its counters.
    pub async fn declare(&self, channel: &str, entry: &RegistryEntry) -> Result<()> {
        if self.store.hget(&self.namespace, channel).await?.is_none() {
            let cleared = self
                .store
                .hdel(&self.namespace, &counter_fields(channel))
                .await?;
            if !cleared.is_empty() {
                warn!(channel, fields = cleared.len(), "cleared orphan counters");
            }
        }
        let patch = match serde_json::to_value(entry)? {
            Value::Object(patch) => patch,
            _ => Map::new(),
        };
        self.set_or_merge(channel, patch).await
    }

    pub async fn set_status(&self, channel: &str, status: ChannelStatus) -> Result<()> {
        let mut patch = Map::new();
        patch.insert("status".to_string(), serde_json::to_value(status)?);
        self.set_or_merge(channel, patch).await
    }

    /// Remove a channel's entry and its counters. Returns whether the entry
    /// itself was still there, so only one of several racing deleters wins.
    pub async fn delete(&self, channel: &str) -> Result<bool> {
        let mut fields = vec![channel.to_string()];
        fields.extend(counter_fields(channel));
        let removed = self.store.hdel(&self.namespace, &fields).await?;
        Ok(removed.iter().any(|field| field == channel))
    }

    pub async fn increment_counter(&self, channel: &str, kind: CounterKind) -> Result<u64> {
        let value = self
            .store
            .hincrby(&self.namespace, &counter_field(channel, kind), 1)
            .await?;
        Ok(value.max(0) as u64)
    }

    /// All three counters in one round trip. Missing counters read as 0.
    pub async fn get_counters(&self, channel: &str) -> Result<Counters> {
        let values = self
            .store
            .hmget(&self.namespace, &counter_fields(channel))
            .await?;
        let read = |i: usize| -> u64 {
            values
                .get(i)
                .and_then(|v| v.as_deref())
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v.max(0) as u64)
                .unwrap_or(0)
        };
        Ok(Counters {
            total: read(0),
            success: read(1),
            failed: read(2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (Arc<MemoryHashStore>, SharedRegistry) {
        let store = Arc::new(MemoryHashStore::new());
        let registry = SharedRegistry::new(store.clone(), DEFAULT_NAMESPACE);
        (store, registry)
    }

    #[tokio::test]
    async fn get_all_skips_counter_fields() {
        let (_, registry) = registry();
        registry
            .declare("batch_1", &RegistryEntry::declared(chrono::Utc::now()))
            .await
            .unwrap();
        registry
            .increment_counter("batch_1", CounterKind::Total)
            .await
            .unwrap();

        let all = registry.get_all().await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["batch_1"]);
    }

    #[tokio::test]
    async fn corrupt_entry_is_absent_but_listed() {
        let (store, registry) = registry();
        store
            .hset(DEFAULT_NAMESPACE, "broken", "not json {{")
            .await
            .unwrap();
        registry
            .declare("fine", &RegistryEntry::declared(chrono::Utc::now()))
            .await
            .unwrap();

        let all = registry.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all["broken"].is_none());
        assert!(all["fine"].is_some());
        assert!(registry.get("broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn declare_clears_orphan_counters() {
        let (_, registry) = registry();
        registry
            .increment_counter("batch_1", CounterKind::Success)
            .await
            .unwrap();
        registry
            .increment_counter("batch_1", CounterKind::Success)
            .await
            .unwrap();

        registry
            .declare("batch_1", &RegistryEntry::declared(chrono::Utc::now()))
            .await
            .unwrap();
        assert_eq!(
            registry.get_counters("batch_1").await.unwrap(),
            Counters::default()
        );
    }

    #[tokio::test]
    async fn declare_keeps_counters_of_listed_channel() {
        let (_, registry) = registry();
        registry
            .declare("batch_1", &RegistryEntry::declared(chrono::Utc::now()))
            .await
            .unwrap();
        registry
            .increment_counter("batch_1", CounterKind::Total)
            .await
            .unwrap();

        registry
            .declare("batch_1", &RegistryEntry::declared(chrono::Utc::now()))
            .await
            .unwrap();
        assert_eq!(registry.get_counters("batch_1").await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn merge_keeps_unpatched_fields() {
        let (_, registry) = registry();
        let started = chrono::Utc::now();
        registry
            .declare("batch_1", &RegistryEntry::declared(started))
            .await
            .unwrap();
        registry
            .set_status("batch_1", ChannelStatus::Final)
            .await
            .unwrap();

        let entry = registry.get("batch_1").await.unwrap().unwrap();
        assert!(entry.is_final());
        assert_eq!(entry.started_at, Some(started));
    }

    #[tokio::test]
    async fn merge_over_corrupt_entry_starts_fresh() {
        let (store, registry) = registry();
        store.hset(DEFAULT_NAMESPACE, "batch_1", "[1,2").await.unwrap();
        registry
            .set_status("batch_1", ChannelStatus::Final)
            .await
            .unwrap();
        assert!(registry.get("batch_1").await.unwrap().unwrap().is_final());
    }

    #[tokio::test]
    async fn counters_default_to_zero_and_increment() {
        let (_, registry) = registry();
        assert_eq!(
            registry.get_counters("batch_1").await.unwrap(),
            Counters::default()
        );

        registry
            .increment_counter("batch_1", CounterKind::Total)
            .await
            .unwrap();
        registry
            .increment_counter("batch_1", CounterKind::Total)
            .await
            .unwrap();
        registry
            .increment_counter("batch_1", CounterKind::Failed)
            .await
            .unwrap();

        let counters = registry.get_counters("batch_1").await.unwrap();
        assert_eq!(counters.total, 2);
        assert_eq!(counters.success, 0);
        assert_eq!(counters.failed, 1);
    }

    #[tokio::test]
    async fn delete_reports_winner_once_and_clears_counters() {
        let (_, registry) = registry();
        registry
            .declare("batch_1", &RegistryEntry::declared(chrono::Utc::now()))
            .await
            .unwrap();
        registry
            .increment_counter("batch_1", CounterKind::Success)
            .await
            .unwrap();

        assert!(registry.delete("batch_1").await.unwrap());
        assert!(!registry.delete("batch_1").await.unwrap());
        assert_eq!(
            registry.get_counters("batch_1").await.unwrap(),
            Counters::default()
        );
        assert!(registry.get_all().await.unwrap().is_empty());
    }
}
