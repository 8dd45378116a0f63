//! In-process store with TTL expiry.

use super::{LocationStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    value: String,
    deadline: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.deadline > now
    }
}

/// [`LocationStore`] kept in memory. Expired keys behave as absent.
#[derive(Default)]
pub struct MemoryLocationStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryLocationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of a live key.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.deadline - now)
    }
}

#[async_trait]
impl LocationStore for MemoryLocationStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|e| e.live(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.live(now) => {
                entry.deadline = now + ttl;
                Ok(true)
            }
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expired_keys_are_absent() {
        let store = MemoryLocationStore::new();
        store.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.scan_prefix("").await.unwrap().is_empty());
        assert!(!store.expire("k", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_extends_live_key() {
        let store = MemoryLocationStore::new();
        store.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;

        assert!(store.expire("k", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.ttl("k"), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_del_reports_existence() {
        let store = MemoryLocationStore::new();
        store.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_prefix_is_sorted() {
        let store = MemoryLocationStore::new();
        let ttl = Duration::from_secs(60);
        store.set_ex("/a/2", "", ttl).await.unwrap();
        store.set_ex("/a/1", "", ttl).await.unwrap();
        store.set_ex("/b/1", "", ttl).await.unwrap();

        assert_eq!(store.scan_prefix("/a/").await.unwrap(), vec!["/a/1", "/a/2"]);
        assert_eq!(store.len(), 3);
    }
}
