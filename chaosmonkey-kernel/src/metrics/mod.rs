//! Metrics sampling around the fault window
//!
//! - `baseline` / `post`: one snapshot labelled `before` / `after`
//! - `continuous`: `duration / interval` snapshots labelled `during_<n>`, at
//!   fixed spacing from the window start; blocks until the window has elapsed
//! - `analyze`: per-metric recovery verdict
//!
//! Node and VM targets read from the system source (node exporter through
//! Prometheus); other kinds use the platform-native source. A failed query
//! never aborts sampling, it yields a snapshot with null fields and the error.

pub mod analysis;
pub mod nomad;
pub mod prometheus;

use crate::config::{Settings, ToleranceSettings};
use crate::errors::SamplingError;
use crate::models::{MetricAnalysis, MetricReading, MetricSnapshot, Target};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pluggable source of metric readings
#[async_trait]
pub trait MetricSource: Send + Sync {
    fn name(&self) -> &str;
    async fn sample(&self, target: &Target) -> Result<MetricReading, SamplingError>;
}

pub struct MetricsSampler {
    system: Option<Arc<dyn MetricSource>>,
    platform: Option<Arc<dyn MetricSource>>,
    query_timeout: Duration,
    tolerance: ToleranceSettings,
}

impl MetricsSampler {
    pub fn new(
        system: Option<Arc<dyn MetricSource>>,
        platform: Option<Arc<dyn MetricSource>>,
        query_timeout: Duration,
        tolerance: ToleranceSettings,
    ) -> Self {
        Self { system, platform, query_timeout, tolerance }
    }

    /// Prometheus when configured, Nomad allocation stats when an address is set
    pub fn from_settings(settings: &Settings) -> Self {
        let system = prometheus::PrometheusSource::from_settings(&settings.prometheus)
            .map(|source| Arc::new(source) as Arc<dyn MetricSource>);
        let platform = nomad::NomadMetrics::from_settings(&settings.platforms.nomad)
            .map(|source| Arc::new(source) as Arc<dyn MetricSource>);
        info!(
            "metrics sources: system={}, platform={}",
            system.as_ref().map(|s| s.name()).unwrap_or("none"),
            platform.as_ref().map(|s| s.name()).unwrap_or("none")
        );
        Self::new(
            system,
            platform,
            Duration::from_secs(settings.experiment.sample_timeout_secs.max(1)),
            settings.experiment.tolerance,
        )
    }

    fn source_for(&self, target: &Target) -> Option<&Arc<dyn MetricSource>> {
        if target.kind.is_host_class() {
            self.system.as_ref().or(self.platform.as_ref())
        } else {
            self.platform.as_ref()
        }
    }

    /// One labelled snapshot; never fails
    pub async fn snapshot(&self, target: &Target, label: &str) -> MetricSnapshot {
        let Some(source) = self.source_for(target) else {
            let err = SamplingError::Unsupported(format!("no metric source for {:?} targets", target.kind));
            warn!("{} {}: {}", target.identifier, label, err);
            return MetricSnapshot::degraded(label, err.to_string());
        };

        let result = match tokio::time::timeout(self.query_timeout, source.sample(target)).await {
            Ok(result) => result,
            Err(_) => Err(SamplingError::Timeout(self.query_timeout)),
        };
        match result {
            Ok(reading) => {
                debug!("{} {} via {}: {:?}", target.identifier, label, source.name(), reading);
                reading.into_snapshot(label)
            }
            Err(e) => {
                warn!("{} {} via {} degraded: {}", target.identifier, label, source.name(), e);
                MetricSnapshot::degraded(label, e.to_string())
            }
        }
    }

    pub async fn baseline(&self, target: &Target) -> MetricSnapshot {
        self.snapshot(target, "before").await
    }

    pub async fn post(&self, target: &Target) -> MetricSnapshot {
        self.snapshot(target, "after").await
    }

    /// Samples at `start + n * interval` for each `n < duration / interval`,
    /// then waits out the rest of the window
    pub async fn continuous(&self, target: &Target, duration: Duration, interval: Duration) -> Vec<MetricSnapshot> {
        let count = if interval.is_zero() { 0 } else { (duration.as_nanos() / interval.as_nanos()) as usize };
        let start = Instant::now();
        let mut samples = Vec::with_capacity(count);

        for n in 0..count {
            tokio::time::sleep_until(start + interval.saturating_mul(n as u32)).await;
            samples.push(self.snapshot(target, &format!("during_{n}")).await);
        }
        tokio::time::sleep_until(start + duration).await;

        let degraded = samples.iter().filter(|s| s.is_degraded()).count();
        if degraded > 0 {
            warn!("{}: {} of {} continuous samples degraded", target.identifier, degraded, samples.len());
        }
        samples
    }

    pub fn analyze(
        &self,
        before: Option<&MetricSnapshot>,
        during: &[MetricSnapshot],
        after: Option<&MetricSnapshot>,
    ) -> BTreeMap<String, MetricAnalysis> {
        analysis::analyze(before, during, after, &self.tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetKind;
    use parking_lot::Mutex;

    struct Recording {
        at: Mutex<Vec<Duration>>,
        start: Instant,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl MetricSource for Recording {
        fn name(&self) -> &str {
            "recording"
        }
        async fn sample(&self, _target: &Target) -> Result<MetricReading, SamplingError> {
            let mut at = self.at.lock();
            at.push(self.start.elapsed());
            if self.fail_at == Some(at.len() - 1) {
                return Err(SamplingError::Unreachable("exporter down".into()));
            }
            Ok(MetricReading { cpu_percent: Some(10.0), ..Default::default() })
        }
    }

    struct Hanging;

    #[async_trait]
    impl MetricSource for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }
        async fn sample(&self, _target: &Target) -> Result<MetricReading, SamplingError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(MetricReading::default())
        }
    }

    fn sampler(source: Arc<dyn MetricSource>) -> MetricsSampler {
        MetricsSampler::new(Some(source), None, Duration::from_secs(5), ToleranceSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_ten_seconds_every_five() {
        let source = Arc::new(Recording { at: Mutex::new(Vec::new()), start: Instant::now(), fail_at: None });
        let sampler = sampler(source.clone());
        let target = Target::new("vm1", TargetKind::Vm);

        let started = Instant::now();
        let samples = sampler.continuous(&target, Duration::from_secs(10), Duration::from_secs(5)).await;

        let labels: Vec<_> = samples.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["during_0", "during_1"]);
        assert_eq!(*source.at.lock(), vec![Duration::ZERO, Duration::from_secs(5)]);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sample_is_null_not_fatal() {
        let source = Arc::new(Recording { at: Mutex::new(Vec::new()), start: Instant::now(), fail_at: Some(1) });
        let sampler = sampler(source);
        let samples = sampler
            .continuous(&Target::new("vm1", TargetKind::Vm), Duration::from_secs(9), Duration::from_secs(3))
            .await;

        assert_eq!(samples.len(), 3);
        assert!(samples[1].is_degraded());
        assert_eq!(samples[1].cpu_percent, None);
        assert_eq!(samples[2].cpu_percent, Some(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_source_times_out() {
        let sampler = sampler(Arc::new(Hanging));
        let snap = sampler.baseline(&Target::new("vm1", TargetKind::Vm)).await;
        assert_eq!(snap.label, "before");
        assert!(snap.error.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn test_non_host_target_without_platform_source() {
        let source = Arc::new(Recording { at: Mutex::new(Vec::new()), start: Instant::now(), fail_at: None });
        let sampler = sampler(source.clone());
        let snap = sampler.post(&Target::new("web-job", TargetKind::Job)).await;
        assert_eq!(snap.label, "after");
        assert!(snap.is_degraded());
        assert!(source.at.lock().is_empty());
    }

    #[tokio::test]
    async fn test_zero_interval_yields_no_samples() {
        let source = Arc::new(Recording { at: Mutex::new(Vec::new()), start: Instant::now(), fail_at: None });
        let samples = sampler(source)
            .continuous(&Target::new("vm1", TargetKind::Vm), Duration::ZERO, Duration::ZERO)
            .await;
        assert!(samples.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_millisecond_interval() {
        let source = Arc::new(Recording { at: Mutex::new(Vec::new()), start: Instant::now(), fail_at: None });
        let sampler = sampler(source.clone());
        let target = Target::new("vm1", TargetKind::Vm);

        let samples = sampler.continuous(&target, Duration::from_millis(2), Duration::from_micros(500)).await;
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[3].label, "during_3");

        let samples = sampler.continuous(&target, Duration::from_millis(3), Duration::from_micros(1500)).await;
        assert_eq!(samples.len(), 2);
    }
}
