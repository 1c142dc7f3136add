//! Shared data model for chaos experiments
//!
//! Everything that crosses a module boundary lives here:
//! - Targets and the raw inventory records they are normalised from
//! - Power actions and power states
//! - Metric snapshots and recovery analysis
//! - Per-target and per-batch outcomes handed to report rendering
//! - The experiment descriptor consumed by the sequencer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Kind of fault-injection subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Node,
    Vm,
    Job,
    Allocation,
    Service,
}

impl TargetKind {
    /// Node and VM targets expose host-level metrics (node exporter)
    pub fn is_host_class(self) -> bool {
        matches!(self, TargetKind::Node | TargetKind::Vm)
    }
}

/// Backends known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Vsphere,
    Olvm,
    Nomad,
}

impl PlatformKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PlatformKind::Vsphere => "vsphere",
            PlatformKind::Olvm => "olvm",
            PlatformKind::Nomad => "nomad",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fault-injection subject, immutable for the duration of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub identifier: String,
    pub display_name: String,
    pub kind: TargetKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_hint: Option<PlatformKind>,
}

impl Target {
    pub fn new(identifier: impl Into<String>, kind: TargetKind) -> Self {
        let identifier = identifier.into();
        Self {
            display_name: identifier.clone(),
            identifier,
            kind,
            platform_hint: None,
        }
    }

    pub fn with_hint(mut self, hint: PlatformKind) -> Self {
        self.platform_hint = Some(hint);
        self
    }
}

/// Normalised power state across backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    Suspended,
    Unknown,
}

/// Inventory record as returned by a backend discovery call
///
/// Only `power_state` and `host` are considered volatile when the cache compares a fresh
/// record against the one it already holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTargetRecord {
    pub id: String,
    pub name: String,
    pub kind: TargetKind,
    pub platform: PlatformKind,
    pub power_state: PowerState,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub cpu: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

impl RawTargetRecord {
    /// Volatile fields used by the cache to classify a record as updated
    pub fn same_volatile_state(&self, other: &RawTargetRecord) -> bool {
        self.power_state == other.power_state && self.host == other.host
    }

    /// Normalise into a `Target`, remembering which backend reported it
    pub fn to_target(&self) -> Target {
        Target {
            identifier: self.id.clone(),
            display_name: self.name.clone(),
            kind: self.kind,
            platform_hint: Some(self.platform),
        }
    }
}

/// Power action applied as a fault or as its rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PowerAction {
    PowerOn,
    PowerOff {
        #[serde(default = "default_graceful")]
        graceful: bool,
    },
    Reboot {
        #[serde(default = "default_graceful")]
        graceful: bool,
    },
}

fn default_graceful() -> bool {
    true
}

impl PowerAction {
    /// Power state the target must reach for the action to count as applied
    pub fn desired_state(self) -> PowerState {
        match self {
            PowerAction::PowerOn | PowerAction::Reboot { .. } => PowerState::On,
            PowerAction::PowerOff { .. } => PowerState::Off,
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerAction::PowerOn => write!(f, "power_on"),
            PowerAction::PowerOff { graceful } => write!(f, "power_off(graceful={graceful})"),
            PowerAction::Reboot { graceful } => write!(f, "reboot(graceful={graceful})"),
        }
    }
}

/// Point-in-time metric reading; all fields are null when the source failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub label: String,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_read_bytes: Option<u64>,
    pub disk_write_bytes: Option<u64>,
    pub collected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetricSnapshot {
    pub fn degraded(label: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            cpu_percent: None,
            memory_percent: None,
            disk_read_bytes: None,
            disk_write_bytes: None,
            collected_at: Utc::now(),
            error: Some(error.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// Raw values returned by a metric source, before labelling
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricReading {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_read_bytes: Option<u64>,
    pub disk_write_bytes: Option<u64>,
}

impl MetricReading {
    pub fn into_snapshot(self, label: impl Into<String>) -> MetricSnapshot {
        MetricSnapshot {
            label: label.into(),
            cpu_percent: self.cpu_percent,
            memory_percent: self.memory_percent,
            disk_read_bytes: self.disk_read_bytes,
            disk_write_bytes: self.disk_write_bytes,
            collected_at: Utc::now(),
            error: None,
        }
    }
}

/// Recovery analysis of one metric across the three phases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAnalysis {
    pub before: Option<f64>,
    pub peak_during: Option<f64>,
    pub after: Option<f64>,
    pub change_during: Option<f64>,
    pub recovered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// One adapter attempt that failed during a registry call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub platform: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub message: String,
    pub attempts: Vec<AttemptFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: PowerAction,
    pub platform_used: Option<String>,
    pub status: ActionStatus,
    pub error: Option<ActionFailure>,
}

impl ActionResult {
    pub fn succeeded(action: PowerAction, platform: impl Into<String>) -> Self {
        Self { action, platform_used: Some(platform.into()), status: ActionStatus::Succeeded, error: None }
    }

    pub fn skipped(action: PowerAction) -> Self {
        Self { action, platform_used: None, status: ActionStatus::Skipped, error: None }
    }

    pub fn failed(action: PowerAction, failure: ActionFailure) -> Self {
        Self { action, platform_used: None, status: ActionStatus::Failed, error: Some(failure) }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Succeeded
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub before: Option<MetricSnapshot>,
    pub during: Vec<MetricSnapshot>,
    pub after: Option<MetricSnapshot>,
}

/// Per-target state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    BaselineSampling,
    Acting,
    ContinuousSampling,
    RollingBack,
    PostSampling,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeState {
    Done,
    Failed,
}

/// Result of one target iteration, immutable once emitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentOutcome {
    pub target: Target,
    pub state: OutcomeState,
    pub action_result: ActionResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_result: Option<ActionResult>,
    pub metrics: PhaseMetrics,
    pub analysis: BTreeMap<String, MetricAnalysis>,
    pub phases: Vec<Phase>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Aggregated result of one batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub run_id: Uuid,
    pub per_target: Vec<ExperimentOutcome>,
    pub unmatched_targets: BTreeSet<String>,
    pub skipped_targets: Vec<String>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Opaque experiment descriptor produced by template/config loading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDescriptor {
    pub action: PowerAction,
    #[serde(default)]
    pub rollback: Option<PowerAction>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub target_ids: BTreeSet<String>,
    #[serde(default)]
    pub dry_run: bool,
    /// Overrides the configured per-action timeout
    #[serde(default, with = "opt_duration_secs", skip_serializing_if = "Option::is_none")]
    pub action_timeout: Option<Duration>,
}

/// Durations are written as whole seconds in descriptors and config files
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

pub mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_yaml() {
        let yaml = r#"
action: { type: power_off, graceful: true }
rollback: { type: power_on }
duration: 60
interval: 10
target_ids: [vm1, vm2]
"#;
        let desc: ExperimentDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(desc.action, PowerAction::PowerOff { graceful: true });
        assert_eq!(desc.rollback, Some(PowerAction::PowerOn));
        assert_eq!(desc.duration, Duration::from_secs(60));
        assert_eq!(desc.target_ids.len(), 2);
        assert!(!desc.dry_run);
        assert!(desc.action_timeout.is_none());
    }

    #[test]
    fn test_graceful_defaults_to_true() {
        let action: PowerAction = serde_json::from_str(r#"{"type":"reboot"}"#).unwrap();
        assert_eq!(action, PowerAction::Reboot { graceful: true });
        assert_eq!(action.desired_state(), PowerState::On);
    }

    #[test]
    fn test_record_to_target_keeps_platform() {
        let record = RawTargetRecord {
            id: "vm-42".into(),
            name: "web-01".into(),
            kind: TargetKind::Vm,
            platform: PlatformKind::Olvm,
            power_state: PowerState::On,
            host: None,
            cpu: Some(2),
            memory_mb: Some(4096),
        };
        let target = record.to_target();
        assert_eq!(target.identifier, "vm-42");
        assert_eq!(target.display_name, "web-01");
        assert_eq!(target.platform_hint, Some(PlatformKind::Olvm));
    }
}
