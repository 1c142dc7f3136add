//! Inventory client - cache-backed discovery across every registered adapter
//!
//! Each adapter is queried under its own cache signature
//! (`<platform>:<filter signature>`). A backend that fails discovery is
//! recorded in the snapshot and skipped; it never aborts the others.

use crate::cache::{CacheLayer, RefreshStats};
use crate::models::{RawTargetRecord, Target};
use crate::platforms::DiscoveryFilter;
use crate::registry::PlatformRegistry;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct InventorySnapshot {
    pub records: Vec<RawTargetRecord>,
    /// Refresh statistics per platform; absent when served from the list cache
    pub refresh: BTreeMap<String, RefreshStats>,
    /// Discovery errors per platform
    pub errors: BTreeMap<String, String>,
}

impl InventorySnapshot {
    /// Normalised targets, in adapter order then backend order
    pub fn targets(&self) -> Vec<Target> {
        self.records.iter().map(RawTargetRecord::to_target).collect()
    }
}

pub struct InventoryClient {
    cache: CacheLayer,
    filter: DiscoveryFilter,
}

impl InventoryClient {
    pub fn new(cache: CacheLayer, filter: DiscoveryFilter) -> Self {
        Self { cache, filter }
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub fn signature(&self, platform: &str) -> String {
        format!("{}:{}", platform, self.filter.signature())
    }

    /// Discover through the cache; `force_refresh` bypasses the list region
    pub async fn snapshot(&self, registry: &PlatformRegistry, force_refresh: bool) -> InventorySnapshot {
        let mut snapshot = InventorySnapshot::default();

        for adapter in registry.adapters() {
            let name = adapter.name();
            let signature = self.signature(name);
            let fetch = || adapter.discover(&self.filter);
            let result = if force_refresh {
                self.cache.refresh(&signature, fetch).await
            } else {
                self.cache.discover(&signature, fetch).await
            };

            match result {
                Ok(discovery) => {
                    if let Some(stats) = discovery.refresh {
                        snapshot.refresh.insert(name.to_string(), stats);
                    }
                    snapshot.records.extend(discovery.records);
                }
                Err(e) => {
                    warn!("{} discovery failed: {}", name, e);
                    snapshot.errors.insert(name.to_string(), e.to_string());
                }
            }
        }

        info!(
            "inventory: {} targets from {} platforms ({} failed)",
            snapshot.records.len(),
            registry.adapters().len(),
            snapshot.errors.len()
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::config::CacheSettings;
    use crate::errors::{ConnectError, PowerError};
    use crate::models::{PlatformKind, PowerAction, PowerState, TargetKind};
    use crate::platforms::PlatformAdapter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Listing {
        kind: PlatformKind,
        records: Result<Vec<RawTargetRecord>, ConnectError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PlatformAdapter for Listing {
        fn kind(&self) -> PlatformKind {
            self.kind
        }
        async fn connect(&self) -> Result<(), ConnectError> {
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn discover(&self, _filter: &DiscoveryFilter) -> Result<Vec<RawTargetRecord>, ConnectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.records.clone()
        }
        async fn power(&self, _id: &str, _action: PowerAction, _timeout: Duration) -> Result<(), PowerError> {
            Ok(())
        }
    }

    fn vm(id: &str, platform: PlatformKind) -> RawTargetRecord {
        RawTargetRecord {
            id: id.into(),
            name: id.into(),
            kind: TargetKind::Vm,
            platform,
            power_state: PowerState::On,
            host: None,
            cpu: None,
            memory_mb: None,
        }
    }

    #[tokio::test]
    async fn test_snapshot_collects_targets_and_errors() {
        let vsphere = Arc::new(Listing {
            kind: PlatformKind::Vsphere,
            records: Ok(vec![vm("vm1", PlatformKind::Vsphere), vm("vm2", PlatformKind::Vsphere)]),
            calls: AtomicUsize::new(0),
        });
        let olvm = Arc::new(Listing {
            kind: PlatformKind::Olvm,
            records: Err(ConnectError::NotConfigured),
            calls: AtomicUsize::new(0),
        });
        let mut registry = PlatformRegistry::new();
        registry.register(vsphere.clone());
        registry.register(olvm);

        let client = InventoryClient::new(
            CacheLayer::new(Arc::new(MemoryStore::new()), &CacheSettings::default()),
            DiscoveryFilter::default(),
        );
        let snapshot = client.snapshot(&registry, false).await;

        let ids: Vec<_> = snapshot.targets().into_iter().map(|t| t.identifier).collect();
        assert_eq!(ids, vec!["vm1", "vm2"]);
        assert_eq!(snapshot.targets()[0].platform_hint, Some(PlatformKind::Vsphere));
        assert_eq!(snapshot.errors.get("olvm").map(String::as_str), Some("not configured"));
        assert_eq!(snapshot.refresh["vsphere"], RefreshStats { new: 2, updated: 0, cached: 0 });

        // second snapshot is served by the list cache
        let again = client.snapshot(&registry, false).await;
        assert_eq!(vsphere.calls.load(Ordering::SeqCst), 1);
        assert!(again.refresh.get("vsphere").is_none());

        let forced = client.snapshot(&registry, true).await;
        assert_eq!(vsphere.calls.load(Ordering::SeqCst), 2);
        assert_eq!(forced.refresh["vsphere"], RefreshStats { new: 0, updated: 0, cached: 2 });
    }
}
