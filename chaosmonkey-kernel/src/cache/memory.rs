//! In-process TTL store
//!
//! Entries expire lazily: an expired entry is dropped the next time it is
//! read, every `PRUNE_EVERY` inserts sweep the whole map, and `stats()`
//! prunes before counting. Time comes from
//! `tokio::time::Instant` so tests can drive expiry on a paused clock.

use super::{CacheStats, CacheStore};
use crate::errors::CacheError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

const PRUNE_EVERY: u64 = 64;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) < self.ttl
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&self, now: Instant) {
        self.entries.lock().retain(|_, entry| entry.is_live(now));
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let value = match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };
        drop(entries);

        match value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        if (self.inserts.fetch_add(1, Ordering::Relaxed) + 1) % PRUNE_EVERY == 0 {
            self.prune(now);
        }
        let entry = CacheEntry { key: key.to_string(), value, inserted_at: now, ttl };
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn clear(&self, pattern: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !glob_match(pattern, key));
        Ok(before - entries.len())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        self.prune(Instant::now());
        Ok(CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            key_count: self.entries.lock().len() as u64,
        })
    }
}

/// Redis-style key pattern: `*` matches any run, `?` matches one character
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    let (mut pi, mut ki) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while ki < k.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == k[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            resume = ki;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ki = resume;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get_until_ttl_elapses() {
        let store = MemoryStore::new();
        store.set("k", b"v".to_vec(), Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_count_hits_misses_and_live_keys() {
        let store = MemoryStore::new();
        store.set("short", b"1".to_vec(), Duration::from_secs(5)).await.unwrap();
        store.set("long", b"2".to_vec(), Duration::from_secs(300)).await.unwrap();

        store.get("short").await.unwrap();
        store.get("absent").await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.key_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_expired_entries() {
        let store = MemoryStore::new();
        store.set("stale", b"x".to_vec(), Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        for i in 1..PRUNE_EVERY - 1 {
            store.set(&format!("fresh:{i}"), vec![], Duration::from_secs(60)).await.unwrap();
        }
        assert_eq!(store.entries.lock().len(), PRUNE_EVERY as usize - 1);

        store.set("last", vec![], Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.entries.lock().len(), PRUNE_EVERY as usize - 1);
        assert!(!store.entries.lock().contains_key("stale"));
    }

    #[tokio::test]
    async fn test_clear_by_pattern() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.set("inventory:vsphere:list", vec![], ttl).await.unwrap();
        store.set("inventory:vsphere:record:vm1", vec![], ttl).await.unwrap();
        store.set("inventory:olvm:list", vec![], ttl).await.unwrap();

        let removed = store.clear("inventory:vsphere:*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get("inventory:olvm:list").await.unwrap().is_some());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("inventory:*:list", "inventory:nomad:list"));
        assert!(glob_match("vm?", "vm1"));
        assert!(!glob_match("vm?", "vm10"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
    }
}
