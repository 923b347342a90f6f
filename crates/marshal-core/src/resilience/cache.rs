//! Bounded caches: in-memory LRU with TTL, and a disk-backed variant for
//! larger payloads.
//!
//! Both are explicit structures owned by their component and shared by
//! reference; synchronization lives inside.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::io;

// ---------------------------------------------------------------------------
// TtlCache
// ---------------------------------------------------------------------------

struct Entry<V> {
    value: V,
    stored_at: Instant,
    last_access: u64,
}

/// Thread-safe bounded cache evicting on size (least-recently-used) or age.
pub struct TtlCache<K, V> {
    inner: Mutex<CacheInner<K, V>>,
    capacity: usize,
    ttl: Duration,
}

struct CacheInner<K, V> {
    map: HashMap<K, Entry<V>>,
    access_seq: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                access_seq: 0,
            }),
            capacity,
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.access_seq += 1;
        let seq = inner.access_seq;
        let ttl = self.ttl;
        match inner.map.get_mut(key) {
            Some(entry) if entry.stored_at.elapsed() < ttl => {
                entry.last_access = seq;
                Some(entry.value.clone())
            }
            Some(_) => {
                inner.map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.access_seq += 1;
        let seq = inner.access_seq;
        inner.map.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
                last_access: seq,
            },
        );
        if inner.map.len() > self.capacity {
            // Expired entries go first; otherwise evict the LRU entry.
            let ttl = self.ttl;
            inner.map.retain(|_, e| e.stored_at.elapsed() < ttl);
            while inner.map.len() > self.capacity {
                if let Some(lru) = inner
                    .map
                    .iter()
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(k, _)| k.clone())
                {
                    inner.map.remove(&lru);
                }
            }
        }
    }

    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.remove(key);
    }

    /// Drop expired entries eagerly. Returns the live count.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        inner.map.retain(|_, e| e.stored_at.elapsed() < ttl);
        inner.map.len()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// DiskCache
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct DiskEntry {
    stored_at: chrono::DateTime<chrono::Utc>,
    value: serde_json::Value,
}

/// Disk-backed cache serializing one JSON file per key. Same TTL contract
/// as `TtlCache`; size is bounded by retention, not count.
pub struct DiskCache {
    dir: PathBuf,
    ttl: Duration,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        // Keys are arbitrary strings; hash them into safe filenames.
        let digest = Sha256::digest(key.as_bytes());
        let mut name = String::with_capacity(64);
        for byte in digest {
            name.push_str(&format!("{byte:02x}"));
        }
        self.dir.join(format!("{name}.json"))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let entry: DiskEntry = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        let age = chrono::Utc::now() - entry.stored_at;
        if age.to_std().unwrap_or(Duration::MAX) >= self.ttl {
            std::fs::remove_file(&path)?;
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(entry.value)?))
    }

    pub fn insert<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let entry = DiskEntry {
            stored_at: chrono::Utc::now(),
            value: serde_json::to_value(value)?,
        };
        io::atomic_write(
            &self.entry_path(key),
            serde_json::to_string(&entry)?.as_bytes(),
        )
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn get_returns_inserted_value() {
        let cache: TtlCache<String, u32> = TtlCache::new(4, Duration::from_secs(60));
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".into()), Some(1));
        assert_eq!(cache.get(&"b".into()), None);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache: TtlCache<String, u32> = TtlCache::new(4, Duration::from_millis(10));
        cache.insert("a".into(), 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(&"a".into()), None);
        assert_eq!(cache.purge_expired(), 0);
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let cache: TtlCache<String, u32> = TtlCache::new(2, Duration::from_secs(60));
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);
        // Touch "a" so "b" is the LRU entry
        assert_eq!(cache.get(&"a".into()), Some(1));
        cache.insert("c".into(), 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b".into()), None);
        assert_eq!(cache.get(&"a".into()), Some(1));
        assert_eq!(cache.get(&"c".into()), Some(3));
    }

    #[test]
    fn disk_cache_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path().join("cache"), Duration::from_secs(60));
        cache
            .insert("report:2026-08", &serde_json::json!({"rows": 42}))
            .unwrap();
        let value: Option<serde_json::Value> = cache.get("report:2026-08").unwrap();
        assert_eq!(value, Some(serde_json::json!({"rows": 42})));

        let missing: Option<serde_json::Value> = cache.get("report:2026-09").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn disk_cache_expires_entries() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path().join("cache"), Duration::from_millis(10));
        cache.insert("k", &"v").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let value: Option<String> = cache.get("k").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn disk_cache_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path().join("cache"), Duration::from_secs(60));
        cache.insert("k", &"v").unwrap();
        cache.remove("k").unwrap();
        cache.remove("k").unwrap();
        let value: Option<String> = cache.get("k").unwrap();
        assert!(value.is_none());
    }
}
