//! Inventory cache layer
//!
//! Two regions, both keyed by a backend+query signature:
//! - list region (`inventory:<sig>:list`): whole discovery result, short TTL
//! - record region (`inventory:<sig>:record:<id>`): one record per identifier, longer TTL
//!
//! A list hit short-circuits discovery. On a miss the fresh records are
//! classified against the record region as `new`, `updated` or `cached`, and an
//! unchanged record is reused exactly as it was cached.
//!
//! Backend failures never leave this module: the layer degrades to
//! pass-through (every read misses, nothing is stored) and logs one warning
//! per operation.

pub mod memory;

use crate::config::CacheSettings;
use crate::errors::CacheError;
use crate::models::RawTargetRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub key_count: u64,
}

/// Key/value store with per-key TTL
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;
    /// Removes every key matching a `*`/`?` pattern, returns how many were removed
    async fn clear(&self, pattern: &str) -> Result<usize, CacheError>;
    async fn stats(&self) -> Result<CacheStats, CacheError>;
}

/// Incremental-update statistics of one refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshStats {
    pub new: usize,
    pub updated: usize,
    pub cached: usize,
}

impl RefreshStats {
    pub fn total(&self) -> usize {
        self.new + self.updated + self.cached
    }
}

/// Result of a cache-backed discovery call
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    pub records: Vec<RawTargetRecord>,
    /// `None` when served from the list region without touching upstream
    pub refresh: Option<RefreshStats>,
}

#[derive(Clone)]
pub struct CacheLayer {
    store: Option<Arc<dyn CacheStore>>,
    list_ttl: Duration,
    record_ttl: Duration,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn CacheStore>, settings: &CacheSettings) -> Self {
        Self {
            store: settings.enabled.then_some(store),
            list_ttl: Duration::from_secs(settings.list_ttl_secs),
            record_ttl: Duration::from_secs(settings.record_ttl_secs),
        }
    }

    /// Pass-through layer that never stores anything
    pub fn disabled() -> Self {
        let defaults = CacheSettings::default();
        Self {
            store: None,
            list_ttl: Duration::from_secs(defaults.list_ttl_secs),
            record_ttl: Duration::from_secs(defaults.record_ttl_secs),
        }
    }

    pub fn list_key(signature: &str) -> String {
        format!("inventory:{signature}:list")
    }

    pub fn record_key(signature: &str, id: &str) -> String {
        format!("inventory:{signature}:record:{id}")
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let store = self.store.as_ref()?;
        match store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("cache get {} failed, treating as miss: {}", key, e);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.set(key, value, ttl).await {
            warn!("cache set {} failed, value not stored: {}", key, e);
        }
    }

    pub async fn clear(&self, pattern: &str) -> usize {
        let Some(store) = &self.store else { return 0 };
        match store.clear(pattern).await {
            Ok(removed) => {
                info!("cache cleared {} keys matching {}", removed, pattern);
                removed
            }
            Err(e) => {
                warn!("cache clear {} failed: {}", pattern, e);
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let Some(store) = &self.store else { return CacheStats::default() };
        store.stats().await.unwrap_or_else(|e| {
            warn!("cache stats unavailable: {}", e);
            CacheStats::default()
        })
    }

    /// Discovery through the list region, falling back to `fetch` on a miss
    pub async fn discover<F, Fut, E>(&self, signature: &str, fetch: F) -> Result<Discovery, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<RawTargetRecord>, E>>,
    {
        let mut op = Op::new(self.store.clone(), signature);
        if let Some(records) = op.read::<Vec<RawTargetRecord>>(&Self::list_key(signature)).await {
            debug!("inventory {} served from list cache ({} records)", signature, records.len());
            return Ok(Discovery { records, refresh: None });
        }
        self.refresh_with(op, fetch).await
    }

    /// Bypass the list region and classify fresh upstream data
    pub async fn refresh<F, Fut, E>(&self, signature: &str, fetch: F) -> Result<Discovery, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<RawTargetRecord>, E>>,
    {
        let op = Op::new(self.store.clone(), signature);
        self.refresh_with(op, fetch).await
    }

    async fn refresh_with<F, Fut, E>(&self, mut op: Op, fetch: F) -> Result<Discovery, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<RawTargetRecord>, E>>,
    {
        let fresh = fetch().await?;
        let mut stats = RefreshStats::default();
        let mut records = Vec::with_capacity(fresh.len());

        for record in fresh {
            let key = Self::record_key(&op.signature, &record.id);
            let merged = match op.read::<RawTargetRecord>(&key).await {
                Some(previous) if previous.same_volatile_state(&record) => {
                    stats.cached += 1;
                    previous
                }
                Some(_) => {
                    stats.updated += 1;
                    record
                }
                None => {
                    stats.new += 1;
                    record
                }
            };
            op.write(&key, &merged, self.record_ttl).await;
            records.push(merged);
        }

        op.write(&Self::list_key(&op.signature), &records, self.list_ttl).await;
        info!(
            "inventory {} refreshed: {} new, {} updated, {} cached",
            op.signature, stats.new, stats.updated, stats.cached
        );
        Ok(Discovery { records, refresh: Some(stats) })
    }
}

/// One cache operation; the first backend failure switches it to pass-through
struct Op {
    store: Option<Arc<dyn CacheStore>>,
    signature: String,
}

impl Op {
    fn new(store: Option<Arc<dyn CacheStore>>, signature: &str) -> Self {
        Self { store, signature: signature.to_string() }
    }

    fn degrade(&mut self, err: CacheError) {
        warn!("cache unavailable during {} discovery, continuing uncached: {}", self.signature, err);
        self.store = None;
    }

    async fn read<T: serde::de::DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        let store = self.store.clone()?;
        match store.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!("dropping undecodable cache entry {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.degrade(e);
                None
            }
        }
    }

    async fn write<T: Serialize>(&mut self, key: &str, value: &T, ttl: Duration) {
        let Some(store) = self.store.clone() else { return };
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("skipping cache write for {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = store.set(key, bytes, ttl).await {
            self.degrade(e);
        }
    }
}
