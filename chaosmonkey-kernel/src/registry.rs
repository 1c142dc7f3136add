//! Platform registry - ordered fallback chain of adapters
//!
//! `perform` tries the target's hinted adapter first (when present), then every
//! other adapter in declared order, and stops at the first success. Each adapter
//! is attempted at most once per call; retries are the adapter's own business.
//! When the whole chain fails the caller gets one sub-error per adapter.
//! `batch_power` fans one action over many ids on a single adapter, bounded by
//! `experiment.batch_parallelism`.

use crate::config::{ExperimentSettings, Settings};
use crate::errors::{AdapterFailure, AggregateError, ConnectError, PowerError};
use crate::models::{PlatformKind, PowerAction, Target};
use crate::platforms::{build_adapters, PlatformAdapter};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct PlatformRegistry {
    adapters: Vec<Arc<dyn PlatformAdapter>>,
    batch_parallelism: usize,
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self { adapters: Vec::new(), batch_parallelism: ExperimentSettings::default().batch_parallelism }
    }
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry following `platforms.order` from the settings
    pub fn from_settings(settings: &Settings) -> Self {
        let registry = Self {
            adapters: build_adapters(settings),
            batch_parallelism: settings.experiment.batch_parallelism,
        };
        info!(
            "platform registry: [{}], batch parallelism {}",
            registry.list().join(", "),
            registry.batch_parallelism
        );
        registry
    }

    pub fn with_batch_parallelism(mut self, parallelism: usize) -> Self {
        self.batch_parallelism = parallelism.max(1);
        self
    }

    pub fn batch_parallelism(&self) -> usize {
        self.batch_parallelism
    }

    /// Appends an adapter at the end of the fallback chain
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        if self.get(adapter.kind()).is_some() {
            warn!("platform {} already registered, replacing it", adapter.name());
            self.adapters.retain(|a| a.kind() != adapter.kind());
        }
        self.adapters.push(adapter);
    }

    pub fn get(&self, kind: PlatformKind) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.iter().find(|a| a.kind() == kind).cloned()
    }

    /// Adapter names in fallback order
    pub fn list(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    pub fn adapters(&self) -> &[Arc<dyn PlatformAdapter>] {
        &self.adapters
    }

    pub fn kind_of(&self, name: &str) -> Option<PlatformKind> {
        self.adapters.iter().find(|a| a.name() == name).map(|a| a.kind())
    }

    /// Attempt order for one target: hint first, then declared order
    pub fn chain_for(&self, target: &Target) -> Vec<Arc<dyn PlatformAdapter>> {
        let hinted = target.platform_hint.and_then(|hint| self.get(hint));
        let mut chain: Vec<Arc<dyn PlatformAdapter>> = hinted.iter().cloned().collect();
        chain.extend(
            self.adapters
                .iter()
                .filter(|a| Some(a.kind()) != hinted.as_ref().map(|h| h.kind()))
                .cloned(),
        );
        chain
    }

    /// Apply `action` through the first adapter that succeeds, returning its name
    pub async fn perform(&self, target: &Target, action: PowerAction, timeout: Duration) -> Result<String, AggregateError> {
        let mut failures = Vec::new();

        for adapter in self.chain_for(target) {
            let name = adapter.name();
            debug!("trying {} for {} on {}", name, action, target.identifier);

            let attempt = match adapter.connect().await {
                Ok(()) => adapter.power(&target.identifier, action, timeout).await,
                Err(e) => Err(PowerError::Connect(e)),
            };
            match attempt {
                Ok(()) => {
                    info!("{} applied {} to {}", name, action, target.identifier);
                    return Ok(name.to_string());
                }
                Err(error) => {
                    warn!("{} failed {} on {}: {}", name, action, target.identifier, error);
                    failures.push(AdapterFailure { platform: name.to_string(), error });
                }
            }
        }

        Err(AggregateError { target: target.identifier.clone(), failures })
    }

    /// Apply `action` to every id through one adapter, connecting once first.
    /// No fallback: a missing adapter or a failed connect is reported per id.
    pub async fn batch_power(
        &self,
        kind: PlatformKind,
        target_ids: &[String],
        action: PowerAction,
        timeout: Duration,
    ) -> BTreeMap<String, Result<(), PowerError>> {
        let connected = match self.get(kind) {
            Some(adapter) => adapter.connect().await.map(|()| adapter),
            None => Err(ConnectError::NotConfigured),
        };
        match connected {
            Ok(adapter) => adapter.batch_power(target_ids, action, timeout, self.batch_parallelism).await,
            Err(error) => {
                warn!("{} batch {} skipped: {}", kind, action, error);
                target_ids.iter().map(|id| (id.clone(), Err(PowerError::Connect(error.clone())))).collect()
            }
        }
    }

    /// Disconnect every adapter; called once at the end of a run
    pub async fn shutdown(&self) {
        for adapter in &self.adapters {
            adapter.disconnect().await;
        }
        debug!("platform registry shut down");
    }
}
