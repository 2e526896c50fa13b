//! Read cache service
//!
//! Ledger reads (transaction lists per principal) are cached behind the
//! [`CacheService`] trait so the in-process [`TtlCache`] can be swapped for a
//! shared cache without touching call sites. Entries expire after a per-key
//! TTL; when the cache is full the oldest insertion is evicted.

use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::debug;

/// Key/value cache with explicit invalidation
#[async_trait]
pub trait CacheService<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Get a live entry
    async fn get(&self, key: &str) -> Option<V>;

    /// Insert or replace an entry using the default TTL
    async fn set(&self, key: &str, value: V);

    /// Check for a live entry
    async fn has(&self, key: &str) -> bool;

    /// Drop an entry, returning whether one was present
    async fn invalidate(&self, key: &str) -> bool;
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    /// Distinguishes re-insertions of the same key in the insertion queue
    generation: u64,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// (key, generation) in insertion order
    insertion_order: VecDeque<(String, u64)>,
    next_generation: u64,
}

/// Bounded in-memory cache with per-key TTL and oldest-insertion eviction
pub struct TtlCache<V> {
    default_ttl: Duration,
    max_entries: usize,
    state: RwLock<CacheState<V>>,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            default_ttl,
            max_entries: max_entries.max(1),
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
                next_generation: 0,
            }),
        }
    }

    /// Insert with an explicit TTL for this key
    pub async fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let mut state = self.state.write().await;
        let generation = state.next_generation;
        state.next_generation += 1;

        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
                generation,
            },
        );
        state.insertion_order.push_back((key.to_string(), generation));

        while state.entries.len() > self.max_entries {
            let Some((oldest, oldest_generation)) = state.insertion_order.pop_front() else {
                break;
            };
            // Skip queue slots superseded by a later re-insertion or invalidation
            let current = state
                .entries
                .get(&oldest)
                .map(|entry| entry.generation == oldest_generation)
                .unwrap_or(false);
            if current {
                state.entries.remove(&oldest);
                debug!(key = %oldest, "Evicted oldest cache entry");
            }
        }

        if state.insertion_order.len() > self.max_entries * 4 {
            let CacheState {
                entries,
                insertion_order,
                ..
            } = &mut *state;
            insertion_order.retain(|(k, g)| {
                entries
                    .get(k)
                    .map(|entry| entry.generation == *g)
                    .unwrap_or(false)
            });
        }
    }
}

#[async_trait]
impl<V> CacheService<V> for TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        {
            let state = self.state.read().await;
            match state.entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone())
                }
                Some(_) => {}
                None => return None,
            }
        }

        let mut state = self.state.write().await;
        let expired = state
            .entries
            .get(key)
            .map(|entry| entry.expires_at <= Instant::now())
            .unwrap_or(false);
        if expired {
            state.entries.remove(key);
        }
        None
    }

    async fn set(&self, key: &str, value: V) {
        self.set_with_ttl(key, value, self.default_ttl).await;
    }

    async fn has(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    async fn invalidate(&self, key: &str) -> bool {
        self.state.write().await.entries.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_has_invalidate() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60), 10);
        assert!(!cache.has("alice").await);

        cache.set("alice", 7).await;
        assert_eq!(cache.get("alice").await, Some(7));
        assert!(cache.has("alice").await);

        assert!(cache.invalidate("alice").await);
        assert!(!cache.invalidate("alice").await);
        assert_eq!(cache.get("alice").await, None);
    }

    #[tokio::test]
    async fn test_entries_expire_per_key() {
        let cache: TtlCache<&'static str> = TtlCache::new(Duration::from_secs(60), 10);
        cache
            .set_with_ttl("short", "gone", Duration::from_millis(20))
            .await;
        cache.set("long", "kept").await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.get("short").await, None);
        assert_eq!(cache.get("long").await, Some("kept"));
    }

    #[tokio::test]
    async fn test_oldest_insertion_is_evicted() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60), 2);
        cache.set("a", 1).await;
        cache.set("b", 2).await;
        cache.set("c", 3).await;

        assert_eq!(cache.state.read().await.entries.len(), 2);
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, Some(2));
        assert_eq!(cache.get("c").await, Some(3));
    }

    #[tokio::test]
    async fn test_reinsert_refreshes_insertion_order() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60), 2);
        cache.set("a", 1).await;
        cache.set("b", 2).await;
        cache.set("a", 10).await;
        cache.set("c", 3).await;

        assert_eq!(cache.get("a").await, Some(10));
        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("c").await, Some(3));
    }
}
