//! In-process implementation of the [`KvStore`] capability.
//!
//! Serves single-process deployments and tests; the trait boundary is
//! where a networked store (Redis-class) would plug in for cross-restart
//! persistence.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::AppError;
use crate::traits::KvStore;

#[derive(Default)]
struct MemoryInner {
    /// String values with optional expiry.
    strings: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    counters: HashMap<String, i64>,
}

impl MemoryInner {
    /// Read a string value, dropping it if expired.
    fn get_live(&mut self, key: &str) -> Option<String> {
        let expired = matches!(
            self.strings.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.strings.remove(key);
            return None;
        }
        self.strings.get(key).map(|(value, _)| value.clone())
    }
}

/// TTL-aware in-memory key-value store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned store mutex");
            poisoned.into_inner()
        })
    }
}

impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.lock().get_live(key))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let deadline = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.lock()
            .strings
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut inner = self.lock();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.sets.remove(key);
        inner.counters.remove(key);
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), AppError> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, AppError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, AppError> {
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), AppError> {
        self.lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, AppError> {
        let mut members: Vec<String> = self
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        // Stable ordering keeps preheat runs deterministic.
        members.sort();
        Ok(members)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, AppError> {
        let mut inner = self.lock();
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += delta;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_ttl_never_expires() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "v", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn hash_operations() {
        let store = MemoryStore::new();
        store.hash_set("site:1", "status", "cached").await.unwrap();
        store.hash_set("site:1", "size", "2048").await.unwrap();

        assert_eq!(
            store.hash_get("site:1", "status").await.unwrap(),
            Some("cached".to_string())
        );
        assert_eq!(store.hash_get("site:1", "missing").await.unwrap(), None);

        let all = store.hash_get_all("site:1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["size"], "2048");
    }

    #[tokio::test]
    async fn set_operations_deduplicate_and_sort() {
        let store = MemoryStore::new();
        store.set_add("routes", "/b").await.unwrap();
        store.set_add("routes", "/a").await.unwrap();
        store.set_add("routes", "/a").await.unwrap();

        assert_eq!(store.set_members("routes").await.unwrap(), vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn delete_clears_every_namespace() {
        let store = MemoryStore::new();
        store.set_with_ttl("k", "v", Duration::ZERO).await.unwrap();
        store.hash_set("k", "f", "v").await.unwrap();
        store.set_add("k", "m").await.unwrap();
        store.incr_by("k", 3).await.unwrap();

        store.delete("k").await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.hash_get_all("k").await.unwrap().is_empty());
        assert!(store.set_members("k").await.unwrap().is_empty());
        assert_eq!(store.incr_by("k", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("n", 2).await.unwrap(), 2);
        assert_eq!(store.incr_by("n", 3).await.unwrap(), 5);
        assert_eq!(store.incr_by("n", -1).await.unwrap(), 4);
    }
}
