/*!
Source de métriques scriptée

Renvoie d'abord les lectures mises en file (`then`), puis la lecture par
défaut à chaque appel.
*/

use async_trait::async_trait;
use chaosmonkey_kernel::errors::SamplingError;
use chaosmonkey_kernel::metrics::MetricSource;
use chaosmonkey_kernel::models::{MetricReading, Target};
use parking_lot::Mutex;
use std::collections::VecDeque;

pub struct StubMetricSource {
    script: Mutex<VecDeque<Result<MetricReading, SamplingError>>>,
    fallback: Result<MetricReading, SamplingError>,
    sampled: Mutex<Vec<String>>,
}

impl StubMetricSource {
    pub fn steady(reading: MetricReading) -> Self {
        Self { script: Mutex::new(VecDeque::new()), fallback: Ok(reading), sampled: Mutex::new(Vec::new()) }
    }

    /// Toutes les requêtes échouent
    pub fn down(error: SamplingError) -> Self {
        Self { script: Mutex::new(VecDeque::new()), fallback: Err(error), sampled: Mutex::new(Vec::new()) }
    }

    pub fn then(self, result: Result<MetricReading, SamplingError>) -> Self {
        self.script.lock().push_back(result);
        self
    }

    /// Identifiants des cibles échantillonnées, dans l'ordre
    pub fn sampled(&self) -> Vec<String> {
        self.sampled.lock().clone()
    }
}

impl Default for StubMetricSource {
    fn default() -> Self {
        Self::steady(MetricReading {
            cpu_percent: Some(15.0),
            memory_percent: Some(40.0),
            disk_read_bytes: Some(2048),
            disk_write_bytes: Some(1024),
        })
    }
}

#[async_trait]
impl MetricSource for StubMetricSource {
    fn name(&self) -> &str {
        "stub"
    }

    async fn sample(&self, target: &Target) -> Result<MetricReading, SamplingError> {
        self.sampled.lock().push(target.identifier.clone());
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}
