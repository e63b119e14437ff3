//! TTL cache store
//!
//! A keyed store whose entries expire after a per-entry time-to-live.
//! Expiry is evaluated lazily on read; there is no background sweeper.
//!
//! The [`CacheStore`] trait is the shared-state contract the connectivity
//! gate is built on. Implementations MUST make [`CacheStore::set_if_absent`]
//! atomic: when several callers race on the same absent key, exactly one of
//! them observes `true`.

use std::time::Duration;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::time::Instant;

/// Keyed store with per-entry expiry
pub trait CacheStore<V>: Send + Sync {
    /// Get the value for `key` if present and not expired
    fn get(&self, key: &str) -> Option<V>;

    /// Insert or replace the value for `key`, expiring after `ttl`
    fn set_with_ttl(&self, key: &str, value: V, ttl: Duration);

    /// Remove `key`; removing a missing key is a no-op
    fn delete(&self, key: &str);

    /// Insert `value` only if `key` is absent or expired.
    ///
    /// Returns `true` if this call inserted the value. The check and the
    /// insert are a single atomic step.
    fn set_if_absent(&self, key: &str, value: V, ttl: Duration) -> bool;
}

#[derive(Clone, Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process [`CacheStore`] backed by a sharded concurrent map.
///
/// `set_if_absent` holds the key's shard lock across the check and the
/// insert, which is what makes it atomic.
#[derive(Debug)]
pub struct MemoryCacheStore<V> {
    entries: DashMap<String, Entry<V>>,
}

impl<V> Default for MemoryCacheStore<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<V> MemoryCacheStore<V> {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));
    }
}

impl<V> CacheStore<V> for MemoryCacheStore<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if entry.is_live(now) {
                return Some(entry.value.clone());
            }
        }
        // Expired: drop it, unless it was replaced since we looked
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        None
    }

    fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    fn set_if_absent(&self, key: &str, value: V, ttl: Duration) -> bool {
        let now = Instant::now();
        let fresh = Entry {
            value,
            expires_at: now + ttl,
        };
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(fresh);
                    true
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_get_returns_live_value() {
        let store = MemoryCacheStore::new();
        store.set_with_ttl("a", 1u32, Duration::from_secs(10));
        assert_eq!(store.get("a"), Some(1));
        assert_eq!(store.get("missing"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_lazily_on_read() {
        let store = MemoryCacheStore::new();
        store.set_with_ttl("a", "v".to_string(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.get("a").as_deref(), Some("v"));
        assert_eq!(store.len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        // Still physically present until someone reads it
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a"), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_replaces_value_and_ttl() {
        let store = MemoryCacheStore::new();
        store.set_with_ttl("a", 1u32, Duration::from_secs(1));
        store.set_with_ttl("a", 2u32, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.get("a"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_is_idempotent() {
        let store = MemoryCacheStore::new();
        store.set_with_ttl("a", 1u32, Duration::from_secs(1));
        store.delete("a");
        store.delete("a");
        assert_eq!(store.get("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_only_first_wins() {
        let store = MemoryCacheStore::new();
        assert!(store.set_if_absent("probe", 1u32, Duration::from_secs(10)));
        assert!(!store.set_if_absent("probe", 2u32, Duration::from_secs(10)));
        assert_eq!(store.get("probe"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_treats_expired_as_absent() {
        let store = MemoryCacheStore::new();
        assert!(store.set_if_absent("probe", 1u32, Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.set_if_absent("probe", 2u32, Duration::from_secs(10)));
        assert_eq!(store.get("probe"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_keeps_live_entries() {
        let store = MemoryCacheStore::new();
        store.set_with_ttl("short", 1u32, Duration::from_secs(1));
        store.set_with_ttl("long", 2u32, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;
        store.purge_expired();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long"), Some(2));
    }

    #[test]
    fn test_set_if_absent_is_atomic_across_threads() {
        let store = Arc::new(MemoryCacheStore::<usize>::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if store.set_if_absent("probe", i, Duration::from_secs(30)) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
