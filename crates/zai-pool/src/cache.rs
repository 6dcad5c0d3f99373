//! Ephemeral key/value store with per-key TTL
//!
//! Leases, the reverse index, cooldown markers and usage counters all live
//! here. The store is a best-effort accelerator: losing it only forces a
//! refresh cycle, never corrupts the credential registry.
//!
//! [`EphemeralCache`] is the seam for a shared backend. [`MemoryCache`] is the
//! in-process implementation; all of its primitives run under a single lock so
//! `set_nx`, `take` and `delete_if_eq` are atomic.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Boxed future returned by [`EphemeralCache`] methods.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Key/value store with expiry.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility (`Arc<dyn EphemeralCache>`).
pub trait EphemeralCache: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;

    /// Write every entry with the same TTL in one step.
    fn set_many<'a>(&'a self, entries: Vec<(String, String)>, ttl: Duration)
    -> CacheFuture<'a, ()>;

    /// Set only if absent. Returns whether this call created the key.
    fn set_nx<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration)
    -> CacheFuture<'a, bool>;

    /// Remove and return a key's value.
    fn take<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;

    /// Remove keys. Returns how many existed.
    fn delete_many<'a>(&'a self, keys: Vec<String>) -> CacheFuture<'a, usize>;

    /// Remove a key only while it still holds `expected`.
    fn delete_if_eq<'a>(&'a self, key: &'a str, expected: &'a str) -> CacheFuture<'a, bool>;

    fn exists<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool>;

    /// Remaining lifetime. `None` if the key is absent or never expires.
    fn ttl<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<Duration>>;

    /// Increment a persistent counter, returning the new value.
    fn incr<'a>(&'a self, key: &'a str) -> CacheFuture<'a, u64>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process [`EphemeralCache`].
///
/// Expired entries are dropped lazily on access and swept on every
/// `set_many`. Uses `tokio::time::Instant` so paused-clock tests control expiry.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Cache("memory cache lock poisoned".into()))
    }

    /// Run `f` on the live entry for `key`, dropping it first if expired.
    fn with_live<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, bool) -> T,
    ) -> Result<T> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        let live = match entries.get(key) {
            Some(entry) if entry.is_live(now) => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        };
        Ok(f(&mut entries, live))
    }
}

fn ready<'a, T: Send + 'a>(result: Result<T>) -> CacheFuture<'a, T> {
    Box::pin(std::future::ready(result))
}

impl EphemeralCache for MemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        ready(self.with_live(key, |entries, live| {
            if live {
                entries.get(key).map(|e| e.value.clone())
            } else {
                None
            }
        }))
    }

    fn set_many<'a>(
        &'a self,
        entries: Vec<(String, String)>,
        ttl: Duration,
    ) -> CacheFuture<'a, ()> {
        let result = self.lock().map(|mut map| {
            let now = Instant::now();
            map.retain(|_, e| e.is_live(now));
            let expires_at = Some(now + ttl);
            for (key, value) in entries {
                map.insert(key, Entry { value, expires_at });
            }
        });
        ready(result)
    }

    fn set_nx<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> CacheFuture<'a, bool> {
        ready(self.with_live(key, |entries, live| {
            if live {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        }))
    }

    fn take<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        ready(self.with_live(key, |entries, live| {
            if live {
                entries.remove(key).map(|e| e.value)
            } else {
                None
            }
        }))
    }

    fn delete_many<'a>(&'a self, keys: Vec<String>) -> CacheFuture<'a, usize> {
        let result = self.lock().map(|mut map| {
            let now = Instant::now();
            keys.iter()
                .filter_map(|key| map.remove(key))
                .filter(|e| e.is_live(now))
                .count()
        });
        ready(result)
    }

    fn delete_if_eq<'a>(&'a self, key: &'a str, expected: &'a str) -> CacheFuture<'a, bool> {
        ready(self.with_live(key, |entries, live| {
            if live && entries.get(key).is_some_and(|e| e.value == expected) {
                entries.remove(key);
                true
            } else {
                false
            }
        }))
    }

    fn exists<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool> {
        ready(self.with_live(key, |_, live| live))
    }

    fn ttl<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<Duration>> {
        ready(self.with_live(key, |entries, live| {
            if !live {
                return None;
            }
            entries
                .get(key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now()))
        }))
    }

    fn incr<'a>(&'a self, key: &'a str) -> CacheFuture<'a, u64> {
        ready(self.with_live(key, |entries, _| {
            let entry = entries.entry(key.to_string()).or_insert(Entry {
                value: "0".into(),
                expires_at: None,
            });
            let next = entry.value.parse::<u64>().unwrap_or(0) + 1;
            entry.value = next.to_string();
            next
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = MemoryCache::new();
        cache
            .set_many(vec![("k".into(), "v".into())], MINUTE)
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cache.ttl("k").await.unwrap(), Some(MINUTE));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!cache.exists("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.ttl("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_only_first_wins_until_expiry() {
        let cache = MemoryCache::new();
        assert!(cache.set_nx("lock", "1", MINUTE).await.unwrap());
        assert!(!cache.set_nx("lock", "2", MINUTE).await.unwrap());
        assert_eq!(cache.get("lock").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(MINUTE).await;
        assert!(cache.set_nx("lock", "3", MINUTE).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn set_nx_is_atomic_under_contention() {
        let cache = Arc::new(MemoryCache::new());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.set_nx("lock", "1", MINUTE).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn take_removes_once() {
        let cache = MemoryCache::new();
        cache
            .set_many(vec![("k".into(), "v".into())], MINUTE)
            .await
            .unwrap();
        assert_eq!(cache.take("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cache.take("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_if_eq_checks_value() {
        let cache = MemoryCache::new();
        cache
            .set_many(vec![("k".into(), "new".into())], MINUTE)
            .await
            .unwrap();
        assert!(!cache.delete_if_eq("k", "old").await.unwrap());
        assert!(cache.exists("k").await.unwrap());
        assert!(cache.delete_if_eq("k", "new").await.unwrap());
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn delete_many_counts_existing() {
        let cache = MemoryCache::new();
        cache
            .set_many(
                vec![("a".into(), "1".into()), ("b".into(), "2".into())],
                MINUTE,
            )
            .await
            .unwrap();
        let removed = cache
            .delete_many(vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn counters_never_expire() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("n").await.unwrap(), 1);
        assert_eq!(cache.incr("n").await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert_eq!(cache.get("n").await.unwrap().as_deref(), Some("2"));
        assert_eq!(cache.ttl("n").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_many_sweeps_expired_entries() {
        let cache = MemoryCache::new();
        cache
            .set_many(vec![("old".into(), "1".into())], MINUTE)
            .await
            .unwrap();
        tokio::time::advance(MINUTE * 2).await;
        cache
            .set_many(vec![("new".into(), "2".into())], MINUTE)
            .await
            .unwrap();
        assert_eq!(cache.entries.lock().unwrap().len(), 1);
    }
}
