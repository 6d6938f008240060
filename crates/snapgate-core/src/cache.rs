//! Render cache: maps a site's URLs to their last successful render.
//!
//! Two interchangeable backends satisfy [`RenderCache`]: an in-process
//! exact-LRU ([`LruRenderCache`]) and a durable variant over the
//! key-value capability ([`KvRenderCache`]) for cross-restart
//! persistence. Freshness is TTL-based by design; staleness up to the
//! TTL is accepted and remedied by the auto-preheat sweep.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::AppError;
use crate::model::RenderResult;
use crate::traits::KvStore;

/// Per-site render cache contract.
///
/// `get` must treat entries older than the TTL as absent. `put` is only
/// called with cacheable results (success, non-empty HTML).
pub trait RenderCache: Send + Sync {
    fn get(&self, url: &str) -> impl Future<Output = Result<Option<RenderResult>, AppError>> + Send;

    fn put(
        &self,
        url: &str,
        result: &RenderResult,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Evict expired entries eagerly. Returns the number removed.
    fn clear_expired(&self) -> impl Future<Output = Result<usize, AppError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory exact LRU
// ---------------------------------------------------------------------------

struct Node {
    key: String,
    result: RenderResult,
    created_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Hash map plus index-linked recency list. `head` is most recently
/// used, `tail` least. All list surgery is O(1).
struct LruInner {
    map: HashMap<String, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruInner {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("live node")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("live node")
    }

    /// Detach a node from the recency list without freeing it.
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let n = self.node(idx);
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let n = self.node_mut(idx);
        n.prev = None;
        n.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let n = self.node_mut(idx);
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head {
            self.node_mut(h).prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn remove(&mut self, idx: usize) -> Node {
        self.unlink(idx);
        let node = self.nodes[idx].take().expect("live node");
        self.map.remove(&node.key);
        self.free.push(idx);
        node
    }

    fn insert_front(&mut self, key: String, result: RenderResult) {
        let node = Node {
            key: key.clone(),
            result,
            created_at: Instant::now(),
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.push_front(idx);
    }
}

/// Capacity-bounded in-process cache with exact least-recently-used
/// eviction, independent of TTL expiry.
pub struct LruRenderCache {
    inner: Mutex<LruInner>,
    capacity: usize,
    ttl: Duration,
}

impl LruRenderCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(LruInner::new(capacity.max(1))),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from most to least recently used, for introspection.
    pub fn keys_by_recency(&self) -> Vec<String> {
        let inner = self.lock();
        let mut keys = Vec::with_capacity(inner.map.len());
        let mut cursor = inner.head;
        while let Some(idx) = cursor {
            let n = inner.node(idx);
            keys.push(n.key.clone());
            cursor = n.next;
        }
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned cache mutex");
            poisoned.into_inner()
        })
    }

    fn expired(&self, created_at: Instant) -> bool {
        !self.ttl.is_zero() && created_at.elapsed() >= self.ttl
    }
}

impl RenderCache for LruRenderCache {
    async fn get(&self, url: &str) -> Result<Option<RenderResult>, AppError> {
        let mut inner = self.lock();
        let Some(&idx) = inner.map.get(url) else {
            return Ok(None);
        };
        if self.expired(inner.node(idx).created_at) {
            inner.remove(idx);
            return Ok(None);
        }
        inner.touch(idx);
        Ok(Some(inner.node(idx).result.clone()))
    }

    async fn put(&self, url: &str, result: &RenderResult) -> Result<(), AppError> {
        let mut inner = self.lock();
        if let Some(&idx) = inner.map.get(url) {
            let node = inner.node_mut(idx);
            node.result = result.clone();
            node.created_at = Instant::now();
            inner.touch(idx);
            return Ok(());
        }
        if inner.map.len() >= self.capacity {
            if let Some(tail) = inner.tail {
                let evicted = inner.remove(tail);
                tracing::debug!(url = %evicted.key, "Evicted least-recently-used cache entry");
            }
        }
        inner.insert_front(url.to_string(), result.clone());
        Ok(())
    }

    async fn clear_expired(&self) -> Result<usize, AppError> {
        let mut inner = self.lock();
        let expired: Vec<usize> = inner
            .map
            .values()
            .copied()
            .filter(|&idx| self.expired(inner.node(idx).created_at))
            .collect();
        let count = expired.len();
        for idx in expired {
            inner.remove(idx);
        }
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Durable key-value backend
// ---------------------------------------------------------------------------

/// Render cache over the durable key-value capability, for deployments
/// that need the cache to survive restarts or be shared across
/// processes. Expiry rides on the store's native TTL.
#[derive(Clone)]
pub struct KvRenderCache<K: KvStore> {
    store: K,
    site_id: String,
    ttl: Duration,
}

impl<K: KvStore> KvRenderCache<K> {
    pub fn new(store: K, site_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            site_id: site_id.into(),
            ttl,
        }
    }

    fn key(&self, url: &str) -> String {
        format!("render:{}:{}", self.site_id, url)
    }
}

impl<K: KvStore> RenderCache for KvRenderCache<K> {
    async fn get(&self, url: &str) -> Result<Option<RenderResult>, AppError> {
        match self.store.get(&self.key(url)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, url: &str, result: &RenderResult) -> Result<(), AppError> {
        let raw = serde_json::to_string(result)?;
        self.store.set_with_ttl(&self.key(url), &raw, self.ttl).await
    }

    async fn clear_expired(&self) -> Result<usize, AppError> {
        // The store expires entries natively.
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Runtime-selected cache backend, chosen from [`CacheConfig::durable`].
///
/// [`CacheConfig::durable`]: crate::config::CacheConfig::durable
pub enum CacheBackend<K: KvStore> {
    Memory(LruRenderCache),
    Durable(KvRenderCache<K>),
}

impl<K: KvStore> RenderCache for CacheBackend<K> {
    async fn get(&self, url: &str) -> Result<Option<RenderResult>, AppError> {
        match self {
            CacheBackend::Memory(c) => c.get(url).await,
            CacheBackend::Durable(c) => c.get(url).await,
        }
    }

    async fn put(&self, url: &str, result: &RenderResult) -> Result<(), AppError> {
        match self {
            CacheBackend::Memory(c) => c.put(url, result).await,
            CacheBackend::Durable(c) => c.put(url, result).await,
        }
    }

    async fn clear_expired(&self) -> Result<usize, AppError> {
        match self {
            CacheBackend::Memory(c) => c.clear_expired().await,
            CacheBackend::Durable(c) => c.clear_expired().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn html(n: usize) -> RenderResult {
        RenderResult::ok(format!("<html><body>page {n}</body></html>"))
    }

    #[tokio::test]
    async fn get_miss_then_hit() {
        let cache = LruRenderCache::new(10, Duration::from_secs(60));
        assert!(cache.get("/a").await.unwrap().is_none());

        cache.put("/a", &html(1)).await.unwrap();
        let hit = cache.get("/a").await.unwrap().unwrap();
        assert!(hit.html.contains("page 1"));
    }

    #[tokio::test]
    async fn capacity_evicts_exactly_the_lru_entry() {
        let cache = LruRenderCache::new(3, Duration::from_secs(60));
        cache.put("/a", &html(1)).await.unwrap();
        cache.put("/b", &html(2)).await.unwrap();
        cache.put("/c", &html(3)).await.unwrap();

        // Access /a so /b becomes least recently used.
        cache.get("/a").await.unwrap().unwrap();

        cache.put("/d", &html(4)).await.unwrap();

        assert!(cache.get("/b").await.unwrap().is_none());
        assert!(cache.get("/a").await.unwrap().is_some());
        assert!(cache.get("/c").await.unwrap().is_some());
        assert!(cache.get("/d").await.unwrap().is_some());
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test]
    async fn access_promotes_to_most_recently_used() {
        let cache = LruRenderCache::new(10, Duration::from_secs(60));
        cache.put("/a", &html(1)).await.unwrap();
        cache.put("/b", &html(2)).await.unwrap();
        assert_eq!(cache.keys_by_recency(), vec!["/b", "/a"]);

        cache.get("/a").await.unwrap().unwrap();
        assert_eq!(cache.keys_by_recency(), vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let cache = LruRenderCache::new(10, Duration::from_millis(20));
        cache.put("/a", &html(1)).await.unwrap();
        assert!(cache.get("/a").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("/a").await.unwrap().is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn put_refreshes_existing_entry() {
        let cache = LruRenderCache::new(10, Duration::from_secs(60));
        cache.put("/a", &html(1)).await.unwrap();
        cache.put("/b", &html(2)).await.unwrap();
        cache.put("/a", &html(9)).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.keys_by_recency(), vec!["/a", "/b"]);
        let hit = cache.get("/a").await.unwrap().unwrap();
        assert!(hit.html.contains("page 9"));
    }

    #[tokio::test]
    async fn clear_expired_removes_only_stale_entries() {
        let cache = LruRenderCache::new(10, Duration::from_millis(30));
        cache.put("/old", &html(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.put("/new", &html(2)).await.unwrap();

        let removed = cache.clear_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("/new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn eviction_reuses_slots_without_growth() {
        let cache = LruRenderCache::new(2, Duration::from_secs(60));
        for i in 0..50 {
            cache.put(&format!("/p{i}"), &html(i)).await.unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get("/p49").await.unwrap().is_some());
        assert!(cache.get("/p48").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn kv_backend_roundtrip_and_ttl() {
        let cache = KvRenderCache::new(MemoryStore::new(), "site-1", Duration::from_millis(20));
        cache.put("/a", &html(1)).await.unwrap();
        let hit = cache.get("/a").await.unwrap().unwrap();
        assert!(hit.success);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn kv_backend_namespaces_by_site() {
        let store = MemoryStore::new();
        let one = KvRenderCache::new(store.clone(), "one", Duration::from_secs(60));
        let two = KvRenderCache::new(store, "two", Duration::from_secs(60));

        one.put("/a", &html(1)).await.unwrap();
        assert!(two.get("/a").await.unwrap().is_none());
    }
}
