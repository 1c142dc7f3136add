/*!
Test Harness pour le noyau ChaosMonkey

Assemble un environnement complet sans backend réel:
- registre de plateformes construit à partir de `MockPlatform`
- échantillonneur branché sur une `StubMetricSource` (système et plateforme)
- séquenceur prêt à l'emploi, avec timeouts courts
*/

use crate::metrics_stub::StubMetricSource;
use crate::platform_stub::MockPlatform;
use anyhow::Result;
use chaosmonkey_kernel::config::ToleranceSettings;
use chaosmonkey_kernel::metrics::MetricSource;
use chaosmonkey_kernel::models::{
    BatchOutcome, ExperimentDescriptor, PlatformKind, PowerAction, PowerState, RawTargetRecord, Target, TargetKind,
};
use chaosmonkey_kernel::{MetricsSampler, PlatformRegistry, Sequencer};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Logs visibles dans la sortie des tests (`RUST_LOG` prioritaire)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chaosmonkey_kernel=debug")))
        .with_test_writer()
        .try_init();
}

pub fn vm_record(id: &str, platform: PlatformKind, power_state: PowerState) -> RawTargetRecord {
    RawTargetRecord {
        id: id.to_string(),
        name: id.to_string(),
        kind: TargetKind::Vm,
        platform,
        power_state,
        host: None,
        cpu: Some(2),
        memory_mb: Some(4096),
    }
}

/// VMs sans indication de plateforme
pub fn vm_targets(ids: &[&str]) -> Vec<Target> {
    ids.iter().map(|id| Target::new(*id, TargetKind::Vm)).collect()
}

/// Fenêtre de 10s échantillonnée toutes les 5s
pub fn descriptor(action: PowerAction, rollback: Option<PowerAction>, ids: &[&str]) -> ExperimentDescriptor {
    ExperimentDescriptor {
        action,
        rollback,
        duration: Duration::from_secs(10),
        interval: Duration::from_secs(5),
        target_ids: ids.iter().map(|id| id.to_string()).collect(),
        dry_run: false,
        action_timeout: None,
    }
}

pub struct TestHarness {
    pub platforms: Vec<Arc<MockPlatform>>,
    pub metrics: Arc<StubMetricSource>,
    pub action_timeout: Duration,
}

impl TestHarness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            platforms: Vec::new(),
            metrics: Arc::new(StubMetricSource::default()),
            action_timeout: Duration::from_secs(30),
        }
    }

    /// Ajoute une plateforme en fin de chaîne de repli
    pub fn with_platform(mut self, platform: MockPlatform) -> Self {
        self.platforms.push(Arc::new(platform));
        self
    }

    pub fn with_metrics(mut self, source: StubMetricSource) -> Self {
        self.metrics = Arc::new(source);
        self
    }

    pub fn platform(&self, kind: PlatformKind) -> Option<Arc<MockPlatform>> {
        use chaosmonkey_kernel::PlatformAdapter;
        self.platforms.iter().find(|p| p.kind() == kind).cloned()
    }

    /// Nouveau registre partageant les mêmes mocks (les compteurs s'accumulent)
    pub fn registry(&self) -> Arc<PlatformRegistry> {
        let mut registry = PlatformRegistry::new();
        for platform in &self.platforms {
            registry.register(platform.clone());
        }
        Arc::new(registry)
    }

    pub fn sampler(&self) -> Arc<MetricsSampler> {
        let source: Arc<dyn MetricSource> = self.metrics.clone();
        Arc::new(MetricsSampler::new(
            Some(source.clone()),
            Some(source),
            Duration::from_secs(5),
            ToleranceSettings::default(),
        ))
    }

    pub fn sequencer(&self) -> Sequencer {
        Sequencer::new(self.registry(), self.sampler(), self.action_timeout)
    }

    pub async fn run(&self, descriptor: &ExperimentDescriptor, inventory: &[Target]) -> Result<BatchOutcome> {
        Ok(self.sequencer().run(descriptor, inventory).await?)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
