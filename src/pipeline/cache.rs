//! TTL cache with a bounded in-memory front over a persistent store.
//!
//! Entries carry their own write timestamp. Freshness is judged against the
//! injected clock, never against the in-memory layer's own timers, so expiry
//! is deterministic under test. Expired entries are dropped lazily when `get`
//! sees them, or in bulk by `sweep_expired`.

use crate::pipeline::clock::Clock;
use crate::pipeline::store::KeyValueStore;
use anyhow::Result;
use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A cached value with its write time and refresh-failure count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    /// Epoch milliseconds of the last successful refresh
    pub timestamp: i64,
    /// Failed refreshes since the last success
    pub retry_count: u32,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh(&self, now_ms: i64, ttl: Duration) -> bool {
        now_ms.saturating_sub(self.timestamp) < ttl.as_millis() as i64
    }
}

/// Result of a non-evicting lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Fresh(T),
    /// Present but older than the TTL; kept for fallback use
    Stale(CacheEntry<T>),
    Miss,
}

/// Typed cache namespace. Keys are stored as `<namespace>:<key>`.
pub struct PersistentCache<T> {
    namespace: String,
    ttl: Duration,
    front: Cache<String, CacheEntry<T>>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl<T> PersistentCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        namespace: impl Into<String>,
        ttl: Duration,
        max_entries: u64,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            ttl,
            front: Cache::builder().max_capacity(max_entries).build(),
            store,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Fresh value for `key`, evicting the entry if it has expired.
    pub async fn get(&self, key: &str) -> Option<T> {
        match self.lookup(key).await {
            Lookup::Fresh(data) => Some(data),
            Lookup::Stale(_) => {
                debug!("Evicting expired cache entry {}", self.store_key(key));
                self.evict(key).await;
                None
            }
            Lookup::Miss => None,
        }
    }

    /// Classify the entry for `key` without evicting it.
    pub async fn lookup(&self, key: &str) -> Lookup<T> {
        let entry = match self.load(key).await {
            Some(entry) => entry,
            None => return Lookup::Miss,
        };

        if entry.is_fresh(self.clock.now_ms(), self.ttl) {
            Lookup::Fresh(entry.data)
        } else {
            Lookup::Stale(entry)
        }
    }

    /// Store a freshly fetched value; resets the retry count.
    pub async fn put(&self, key: &str, value: T) -> Result<()> {
        let entry = CacheEntry {
            data: value,
            timestamp: self.clock.now_ms(),
            retry_count: 0,
        };
        self.write(key, entry).await
    }

    /// Note a failed refresh on an existing entry without touching its age.
    /// Returns the new retry count, or `None` when nothing is cached.
    pub async fn record_failure(&self, key: &str) -> Result<Option<u32>> {
        let Some(mut entry) = self.load(key).await else {
            return Ok(None);
        };
        entry.retry_count = entry.retry_count.saturating_add(1);
        let count = entry.retry_count;
        self.write(key, entry).await?;
        Ok(Some(count))
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.front.invalidate(key).await;
        self.store.remove(&self.store_key(key)).await
    }

    /// Drop every entry in this namespace.
    pub async fn clear(&self) -> Result<()> {
        self.front.invalidate_all();
        let prefix = format!("{}:", self.namespace);
        for key in self.store.keys(&prefix).await? {
            self.store.remove(&key).await?;
        }
        Ok(())
    }

    /// Remove every expired or unreadable entry in this namespace. Returns the
    /// number removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let prefix = format!("{}:", self.namespace);
        let now = self.clock.now_ms();
        let mut removed = 0;

        for store_key in self.store.keys(&prefix).await? {
            let key = &store_key[prefix.len()..];
            let keep = match self.store.get(&store_key).await? {
                Some(text) => serde_json::from_str::<CacheEntry<T>>(&text)
                    .map(|entry| entry.is_fresh(now, self.ttl))
                    .unwrap_or(false),
                None => false,
            };
            if !keep {
                self.front.invalidate(key).await;
                self.store.remove(&store_key).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Swept {} expired entries from {}", removed, self.namespace);
        }
        Ok(removed)
    }

    async fn load(&self, key: &str) -> Option<CacheEntry<T>> {
        if let Some(entry) = self.front.get(key).await {
            return Some(entry);
        }

        let store_key = self.store_key(key);
        let text = match self.store.get(&store_key).await {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cache store read failed for {}: {:#}", store_key, e);
                return None;
            }
        };

        match serde_json::from_str::<CacheEntry<T>>(&text) {
            Ok(entry) => {
                self.front.insert(key.to_string(), entry.clone()).await;
                Some(entry)
            }
            Err(e) => {
                warn!("Discarding corrupt cache entry {}: {}", store_key, e);
                if let Err(e) = self.store.remove(&store_key).await {
                    warn!("Failed to remove corrupt entry {}: {:#}", store_key, e);
                }
                None
            }
        }
    }

    async fn write(&self, key: &str, entry: CacheEntry<T>) -> Result<()> {
        let text = serde_json::to_string(&entry)?;
        self.store.put(&self.store_key(key), &text).await?;
        self.front.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn evict(&self, key: &str) {
        if let Err(e) = self.remove(key).await {
            warn!("Failed to evict {}: {:#}", self.store_key(key), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::ManualClock;
    use crate::pipeline::store::MemoryStore;

    fn cache(clock: &ManualClock, store: Arc<dyn KeyValueStore>) -> PersistentCache<String> {
        PersistentCache::new(
            "meta",
            Duration::from_millis(1000),
            100,
            store,
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let clock = ManualClock::new(10_000);
        let cache = cache(&clock, Arc::new(MemoryStore::new()));
        cache.put("a", "value".to_string()).await.unwrap();

        clock.advance_ms(999);
        assert_eq!(cache.get("a").await.as_deref(), Some("value"));

        clock.advance_ms(1);
        assert_eq!(cache.get("a").await, None);
    }

    #[tokio::test]
    async fn test_get_evicts_but_lookup_keeps_stale() {
        let clock = ManualClock::new(0);
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache(&clock, store.clone());
        cache.put("a", "old".to_string()).await.unwrap();
        clock.advance_ms(5_000);

        match cache.lookup("a").await {
            Lookup::Stale(entry) => assert_eq!(entry.data, "old"),
            other => panic!("expected stale, got {:?}", other),
        }
        assert!(store.get("meta:a").await.unwrap().is_some());

        assert_eq!(cache.get("a").await, None);
        assert!(store.get("meta:a").await.unwrap().is_none());
        assert_eq!(cache.lookup("a").await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_record_failure_and_reset() {
        let clock = ManualClock::new(0);
        let cache = cache(&clock, Arc::new(MemoryStore::new()));

        assert_eq!(cache.record_failure("a").await.unwrap(), None);

        cache.put("a", "v".to_string()).await.unwrap();
        assert_eq!(cache.record_failure("a").await.unwrap(), Some(1));
        assert_eq!(cache.record_failure("a").await.unwrap(), Some(2));

        cache.put("a", "v2".to_string()).await.unwrap();
        clock.advance_ms(2_000);
        match cache.lookup("a").await {
            Lookup::Stale(entry) => assert_eq!(entry.retry_count, 0),
            other => panic!("expected stale, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let clock = ManualClock::new(0);
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.put("meta:a", "{\"data\": 12").await.unwrap();
        store.put("meta:b", "{\"unexpected\": true}").await.unwrap();

        let cache = cache(&clock, store.clone());
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, None);
        assert!(store.get("meta:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let clock = ManualClock::new(0);
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache(&clock, store.clone());

        cache.put("old", "1".to_string()).await.unwrap();
        clock.advance_ms(600);
        cache.put("new", "2".to_string()).await.unwrap();
        store.put("meta:junk", "garbage").await.unwrap();
        store.put("other:x", "untouched").await.unwrap();
        clock.advance_ms(500);

        let removed = cache.sweep_expired().await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.get("new").await.as_deref(), Some("2"));
        assert!(store.get("other:x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reload_from_store() {
        let clock = ManualClock::new(0);
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

        cache(&clock, store.clone()).put("a", "persisted".to_string()).await.unwrap();

        let fresh_process = cache(&clock, store);
        assert_eq!(fresh_process.get("a").await.as_deref(), Some("persisted"));
    }

    /// Reads succeed, every write fails.
    struct ReadOnlyStore(MemoryStore);

    #[async_trait::async_trait]
    impl KeyValueStore for ReadOnlyStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }

        async fn put(&self, _key: &str, _value: &str) -> Result<()> {
            anyhow::bail!("disk full")
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.0.remove(key).await
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
            self.0.keys(prefix).await
        }
    }

    #[tokio::test]
    async fn test_failed_store_write_is_not_served() {
        let clock = ManualClock::new(0);
        let cache = cache(&clock, Arc::new(ReadOnlyStore(MemoryStore::new())));

        assert!(cache.put("a", "unsaved".to_string()).await.is_err());
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.lookup("a").await, Lookup::Miss);
    }
}
