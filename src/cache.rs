//! Time-bounded cache of external-source fetches.
//!
//! Values are stored behind `Arc` and replaced wholesale on refresh, so a
//! reader never observes a partially built listing. Expiry is checked on
//! read; there is no sweeper.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheSlot<V> {
    inserted: DateTime<Utc>,
    value: Arc<V>,
}

/// Cache keyed by source locator (directory path, FTP path, catalog URL).
pub struct ExternalCache<V> {
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<String, CacheSlot<V>>>,
    /// One async lock per key currently being fetched
    fetching: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<V: Send + Sync> ExternalCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500)),
            clock,
            slots: Mutex::new(HashMap::new()),
            fetching: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        let expired = match slots.get(key) {
            None => return None,
            Some(slot) => now - slot.inserted > self.ttl,
        };
        if expired {
            debug!(key, "cache entry expired");
            slots.remove(key);
            return None;
        }
        slots.get(key).map(|slot| Arc::clone(&slot.value))
    }

    pub fn put(&self, key: impl Into<String>, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let slot = CacheSlot {
            inserted: self.clock.now(),
            value: Arc::clone(&value),
        };
        self.slots.lock().insert(key.into(), slot);
        value
    }

    pub fn invalidate(&self, key: &str) {
        self.slots.lock().remove(key);
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    /// Number of slots held, expired ones included until next read.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached value or runs `fetch` once per key, even when
    /// several callers miss at the same time.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let lock = {
            let mut fetching = self.fetching.lock();
            Arc::clone(fetching.entry(key.to_string()).or_default())
        };

        let outcome = {
            let _guard = lock.lock().await;
            match self.get(key) {
                Some(value) => Ok(value),
                None => fetch().await.map(|value| self.put(key, value)),
            }
        };

        let mut fetching = self.fetching.lock();
        // The map and this call are the only holders left
        if Arc::strong_count(&lock) <= 2 {
            fetching.remove(key);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::CatalogError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_with_clock() -> (ExternalCache<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (ExternalCache::with_clock(DEFAULT_TTL, clock.clone()), clock)
    }

    #[test]
    fn test_entry_expires_lazily_after_ttl() {
        let (cache, clock) = cache_with_clock();
        cache.put("ftp://host/pub", "listing".to_string());

        clock.advance(chrono::Duration::seconds(299));
        assert_eq!(cache.get("ftp://host/pub").as_deref(), Some(&"listing".to_string()));

        clock.advance(chrono::Duration::seconds(2));
        assert!(cache.get("ftp://host/pub").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_replaces_without_touching_old_holders() {
        let (cache, _clock) = cache_with_clock();
        let first = cache.put("k", "v1".to_string());
        cache.put("k", "v2".to_string());
        assert_eq!(*first, "v1");
        assert_eq!(*cache.get("k").unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_get_or_fetch_fetches_once_while_fresh() {
        let (cache, clock) = cache_with_clock();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_fetch("http://x/catalog.xml", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("doc".to_string())
                })
                .await
                .unwrap();
            assert_eq!(*value, "doc");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(chrono::Duration::minutes(6));
        cache
            .get_or_fetch("http://x/catalog.xml", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("doc".to_string())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let (cache, _clock) = cache_with_clock();
        let err = cache
            .get_or_fetch("ftp://down", || async {
                Err::<String, _>(CatalogError::unavailable("ftp://down", "refused"))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(cache.get("ftp://down").is_none());
        assert!(cache.fetching.lock().is_empty());
    }
}
