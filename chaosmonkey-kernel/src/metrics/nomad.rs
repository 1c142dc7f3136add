//! Platform-native metrics from the Nomad client API
//!
//! - allocation: `/v1/client/allocation/<id>/stats`, memory relative to the
//!   memory reserved by its tasks
//! - job / service: the same, aggregated over running allocations
//! - node: `/v1/client/stats?node_id=<id>` (used when Prometheus is absent)

use super::MetricSource;
use crate::config::NomadSettings;
use crate::errors::{ConnectError, SamplingError};
use crate::models::{MetricReading, Target, TargetKind};
use crate::platforms::nomad::NomadApi;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AllocStats {
    #[serde(default)]
    resource_usage: ResourceUsage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResourceUsage {
    #[serde(default)]
    cpu_stats: CpuStats,
    #[serde(default)]
    memory_stats: MemoryStats,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CpuStats {
    #[serde(default)]
    percent: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MemoryStats {
    #[serde(default, rename = "RSS")]
    rss: u64,
    #[serde(default)]
    usage: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AllocStub {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    client_status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostStats {
    #[serde(default, rename = "CPU")]
    cpu: Vec<HostCpu>,
    #[serde(default)]
    memory: Option<HostMemory>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostCpu {
    idle: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostMemory {
    total: u64,
    used: u64,
}

/// Memory reserved by every task of an allocation, in bytes
fn reserved_memory_bytes(alloc: &Value) -> Option<u64> {
    let tasks = alloc.get("AllocatedResources")?.get("Tasks")?.as_object()?;
    let mb: u64 = tasks
        .values()
        .filter_map(|t| t.get("Memory")?.get("MemoryMB")?.as_u64())
        .sum();
    (mb > 0).then_some(mb * 1024 * 1024)
}

fn host_reading(stats: &HostStats) -> MetricReading {
    let cpu = (!stats.cpu.is_empty())
        .then(|| 100.0 - stats.cpu.iter().map(|c| c.idle).sum::<f64>() / stats.cpu.len() as f64);
    let memory = stats
        .memory
        .as_ref()
        .filter(|m| m.total > 0)
        .map(|m| m.used as f64 / m.total as f64 * 100.0);
    MetricReading { cpu_percent: cpu, memory_percent: memory, ..Default::default() }
}

fn unreachable(err: ConnectError) -> SamplingError {
    SamplingError::Unreachable(err.to_string())
}

pub struct NomadMetrics {
    api: NomadApi,
}

impl NomadMetrics {
    /// `None` when no Nomad address is configured
    pub fn from_settings(settings: &NomadSettings) -> Option<Self> {
        NomadApi::from_settings(settings).ok().map(|api| Self { api })
    }

    /// CPU percent, memory used and memory reserved for one allocation
    async fn allocation_usage(&self, alloc_id: &str) -> Result<(f64, u64, Option<u64>), SamplingError> {
        let stats: AllocStats = self
            .api
            .get(&format!("/v1/client/allocation/{alloc_id}/stats"))
            .await
            .map_err(unreachable)?
            .ok_or_else(|| SamplingError::NoData(format!("allocation {alloc_id}")))?;
        let alloc: Option<Value> = self.api.get(&format!("/v1/allocation/{alloc_id}")).await.map_err(unreachable)?;
        let memory = &stats.resource_usage.memory_stats;
        let used = if memory.usage > 0 { memory.usage } else { memory.rss };
        Ok((stats.resource_usage.cpu_stats.percent, used, alloc.as_ref().and_then(reserved_memory_bytes)))
    }

    async fn aggregate(&self, alloc_ids: &[String], label: &str) -> Result<MetricReading, SamplingError> {
        if alloc_ids.is_empty() {
            return Err(SamplingError::NoData(format!("{label} has no running allocations")));
        }
        let (mut cpu, mut used, mut reserved) = (0.0, 0u64, 0u64);
        for id in alloc_ids {
            let (c, u, r) = self.allocation_usage(id).await?;
            cpu += c;
            used += u;
            reserved += r.unwrap_or(0);
        }
        Ok(MetricReading {
            cpu_percent: Some(cpu),
            memory_percent: (reserved > 0).then(|| used as f64 / reserved as f64 * 100.0),
            ..Default::default()
        })
    }

    async fn running_allocations(&self, path: &str) -> Result<Vec<String>, SamplingError> {
        let allocs: Vec<AllocStub> = self.api.get(path).await.map_err(unreachable)?.unwrap_or_default();
        Ok(allocs.into_iter().filter(|a| a.client_status == "running").map(|a| a.id).collect())
    }
}

#[async_trait]
impl MetricSource for NomadMetrics {
    fn name(&self) -> &str {
        "nomad"
    }

    async fn sample(&self, target: &Target) -> Result<MetricReading, SamplingError> {
        let id = &target.identifier;
        match target.kind {
            TargetKind::Allocation => self.aggregate(std::slice::from_ref(id), id).await,
            TargetKind::Job | TargetKind::Service => {
                let allocs = self.running_allocations(&format!("/v1/job/{id}/allocations")).await?;
                self.aggregate(&allocs, id).await
            }
            TargetKind::Node => {
                let stats: HostStats = self
                    .api
                    .get(&format!("/v1/client/stats?node_id={id}"))
                    .await
                    .map_err(unreachable)?
                    .ok_or_else(|| SamplingError::NoData(format!("node {id}")))?;
                Ok(host_reading(&stats))
            }
            TargetKind::Vm => Err(SamplingError::Unsupported(format!("{id} is a VM, not a Nomad object"))),
        }
    }
}
