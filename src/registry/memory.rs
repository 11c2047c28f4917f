//! In-process hash store for tests and single-node development.
//!
//! Clones share state, so several `Fabric` instances built on clones of one
//! store behave like processes sharing one registry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::HashStore;
use crate::error::{Error, Result};

type Namespaces = HashMap<String, HashMap<String, String>>;

#[derive(Clone, Default)]
pub struct MemoryHashStore {
    inner: Arc<Mutex<Namespaces>>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Namespaces> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl HashStore for MemoryHashStore {
    async fn hgetall(&self, namespace: &str) -> Result<HashMap<String, String>> {
        Ok(self.lock().get(namespace).cloned().unwrap_or_default())
    }

    async fn hget(&self, namespace: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .get(namespace)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hset(&self, namespace: &str, field: &str, value: &str) -> Result<()> {
        self.lock()
            .entry(namespace.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, namespace: &str, fields: &[String]) -> Result<Vec<String>> {
        let mut guard = self.lock();
        let Some(hash) = guard.get_mut(namespace) else {
            return Ok(Vec::new());
        };
        Ok(fields
            .iter()
            .filter(|field| hash.remove(field.as_str()).is_some())
            .cloned()
            .collect())
    }

    async fn hincrby(&self, namespace: &str, field: &str, by: i64) -> Result<i64> {
        let mut guard = self.lock();
        let slot = guard
            .entry(namespace.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert_with(|| "0".to_string());
        let current: i64 = slot
            .parse()
            .map_err(|_| Error::Other(format!("hash value at {field} is not an integer")))?;
        let next = current + by;
        *slot = next.to_string();
        Ok(next)
    }

    async fn hmget(&self, namespace: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let guard = self.lock();
        let hash = guard.get(namespace);
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|h| h.get(field)).cloned())
            .collect())
    }
}
