use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Key-value store backing the cache middleware.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn read(&self, key: &str) -> Option<Value>;

    /// `ttl = None` keeps the entry until it is evicted.
    async fn write(&self, key: &str, value: Value, ttl: Option<Duration>);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
}

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    lru_order: VecDeque<String>,
    stats: CacheStats,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        self.lru_order.retain(|k| k != key);
        self.lru_order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.lru_order.retain(|k| k != key);
    }

    fn pop_lru(&mut self) -> Option<String> {
        let key = self.lru_order.pop_front()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Bounded in-process cache with per-entry TTL and LRU eviction.
pub struct InMemoryCacheStore {
    state: Mutex<CacheState>,
    capacity: usize,
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryCacheStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.lru_order.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn read(&self, key: &str) -> Option<Value> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let (value, expired) = match state.entries.get(key) {
            Some(entry) if entry.is_expired(now) => (None, true),
            Some(entry) => (Some(entry.value.clone()), false),
            None => (None, false),
        };
        if expired {
            state.remove(key);
        }
        match value {
            Some(value) => {
                state.touch(key);
                state.stats.hits += 1;
                Some(value)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    async fn write(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let mut state = self.state.lock();
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        state
            .entries
            .insert(key.to_string(), CacheEntry { value, expires_at });
        state.touch(key);
        state.stats.writes += 1;
        while state.entries.len() > self.capacity {
            match state.pop_lru() {
                Some(evicted) => {
                    state.stats.evictions += 1;
                    tracing::debug!(key = %evicted, "cache entry evicted");
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_read_write_and_stats() {
        let store = InMemoryCacheStore::new(8);
        assert_eq!(store.read("k").await, None);
        store.write("k", json!("v"), None).await;
        assert_eq!(store.read("k").await, Some(json!("v")));
        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryCacheStore::new(8);
        store.write("k", json!(1), Some(Duration::from_secs(60))).await;
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(store.read("k").await, Some(json!(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.read("k").await, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let store = InMemoryCacheStore::new(2);
        store.write("a", json!(1), None).await;
        store.write("b", json!(2), None).await;
        // Touch "a" so "b" becomes least recently used.
        store.read("a").await;
        store.write("c", json!(3), None).await;
        assert_eq!(store.read("b").await, None);
        assert_eq!(store.read("a").await, Some(json!(1)));
        assert_eq!(store.read("c").await, Some(json!(3)));
        assert_eq!(store.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = InMemoryCacheStore::default();
        store.write("a", json!(1), None).await;
        store.clear();
        assert_eq!(store.read("a").await, None);
    }
}
