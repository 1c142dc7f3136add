//! Experiment sequencer - the top-level control loop
//!
//! Per target, strictly in order:
//! `Idle -> BaselineSampling -> Acting -> ContinuousSampling -> RollingBack? -> PostSampling -> Done`
//!
//! - a failed action goes straight to `Failed` with no during/after samples
//! - degraded samples are recorded and never change the control flow
//! - a failed rollback is recorded on the outcome, the target still ends `Done`
//!
//! Targets run one at a time. Cancellation is observed only between targets;
//! targets not started are listed as skipped. Every finished outcome is pushed
//! to the `OutcomeLog` and the optional outcome channel before the next target
//! starts.

use crate::errors::ResolutionError;
use crate::metrics::MetricsSampler;
use crate::models::{
    ActionResult, BatchOutcome, ExperimentDescriptor, ExperimentOutcome, OutcomeState, Phase, PhaseMetrics, PowerAction,
    Target,
};
use crate::registry::PlatformRegistry;
use crate::resolver::resolve;
use crate::state::OutcomeLog;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Phase history of one target
struct PhaseTracker<'a> {
    target: &'a str,
    history: Vec<Phase>,
}

impl<'a> PhaseTracker<'a> {
    fn new(target: &'a str) -> Self {
        Self { target, history: vec![Phase::Idle] }
    }

    fn enter(&mut self, phase: Phase) {
        let from = self.history.last().copied().unwrap_or(Phase::Idle);
        debug!("{}: {:?} -> {:?}", self.target, from, phase);
        self.history.push(phase);
    }

    fn finish(mut self, phase: Phase) -> Vec<Phase> {
        self.enter(phase);
        self.history
    }
}

pub struct Sequencer {
    registry: Arc<PlatformRegistry>,
    sampler: Arc<MetricsSampler>,
    action_timeout: Duration,
    cancel: CancellationToken,
    outcomes: Option<UnboundedSender<ExperimentOutcome>>,
    log: OutcomeLog,
}

impl Sequencer {
    pub fn new(registry: Arc<PlatformRegistry>, sampler: Arc<MetricsSampler>, action_timeout: Duration) -> Self {
        Self {
            registry,
            sampler,
            action_timeout,
            cancel: CancellationToken::new(),
            outcomes: None,
            log: OutcomeLog::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Every outcome is sent here as soon as its target completes
    pub fn with_outcome_channel(mut self, sender: UnboundedSender<ExperimentOutcome>) -> Self {
        self.outcomes = Some(sender);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn outcome_log(&self) -> OutcomeLog {
        self.log.clone()
    }

    /// Run the batch; only a total resolution failure aborts it
    pub async fn run(&self, descriptor: &ExperimentDescriptor, inventory: &[Target]) -> Result<BatchOutcome, ResolutionError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let resolution = match resolve(&descriptor.target_ids, inventory) {
            Ok(resolution) => resolution,
            Err(e) => {
                error!("run {} aborted: {}", run_id, e);
                self.registry.shutdown().await;
                return Err(e);
            }
        };
        let timeout = descriptor.action_timeout.unwrap_or(self.action_timeout);
        info!(
            "run {}: {} on {} targets ({} unmatched){}",
            run_id,
            descriptor.action,
            resolution.matched.len(),
            resolution.unmatched.len(),
            if descriptor.dry_run { " [dry run]" } else { "" }
        );

        let mut per_target = Vec::with_capacity(resolution.matched.len());
        let mut skipped_targets = Vec::new();
        let mut cancelled = false;

        for (index, target) in resolution.matched.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                skipped_targets = resolution.matched[index..].iter().map(|t| t.identifier.clone()).collect();
                warn!("run {} cancelled, skipping {} remaining targets", run_id, skipped_targets.len());
                break;
            }

            let outcome = self.run_target(target, descriptor, timeout).await;
            self.log.push(outcome.clone());
            if let Some(sender) = &self.outcomes {
                if sender.send(outcome.clone()).is_err() {
                    debug!("outcome receiver dropped");
                }
            }
            per_target.push(outcome);
        }

        self.registry.shutdown().await;

        let failed = per_target.iter().filter(|o| o.state == OutcomeState::Failed).count();
        info!("run {} finished: {} done, {} failed, {} skipped", run_id, per_target.len() - failed, failed, skipped_targets.len());

        Ok(BatchOutcome {
            run_id,
            per_target,
            unmatched_targets: resolution.unmatched,
            skipped_targets,
            cancelled,
            started_at,
            completed_at: Utc::now(),
        })
    }

    /// One target through the full state machine
    pub async fn run_target(&self, target: &Target, descriptor: &ExperimentDescriptor, timeout: Duration) -> ExperimentOutcome {
        let started_at = Utc::now();
        let mut phases = PhaseTracker::new(&target.identifier);

        if descriptor.dry_run {
            info!("{}: dry run, {} not applied", target.identifier, descriptor.action);
            return ExperimentOutcome {
                target: target.clone(),
                state: OutcomeState::Done,
                action_result: ActionResult::skipped(descriptor.action),
                rollback_result: descriptor.rollback.map(ActionResult::skipped),
                metrics: PhaseMetrics::default(),
                analysis: BTreeMap::new(),
                phases: phases.finish(Phase::Done),
                started_at,
                completed_at: Utc::now(),
            };
        }

        phases.enter(Phase::BaselineSampling);
        let before = self.sampler.baseline(target).await;

        phases.enter(Phase::Acting);
        let platform = match self.registry.perform(target, descriptor.action, timeout).await {
            Ok(platform) => platform,
            Err(e) => {
                error!("{}: {} failed on every platform: {}", target.identifier, descriptor.action, e);
                return ExperimentOutcome {
                    target: target.clone(),
                    state: OutcomeState::Failed,
                    action_result: ActionResult::failed(descriptor.action, e.to_failure()),
                    rollback_result: None,
                    metrics: PhaseMetrics { before: Some(before), during: Vec::new(), after: None },
                    analysis: BTreeMap::new(),
                    phases: phases.finish(Phase::Failed),
                    started_at,
                    completed_at: Utc::now(),
                };
            }
        };

        phases.enter(Phase::ContinuousSampling);
        let during = self.sampler.continuous(target, descriptor.duration, descriptor.interval).await;

        let rollback_result = match descriptor.rollback {
            Some(rollback) => {
                phases.enter(Phase::RollingBack);
                Some(self.roll_back(target, &platform, rollback, timeout).await)
            }
            None => None,
        };

        phases.enter(Phase::PostSampling);
        let after = self.sampler.post(target).await;
        let analysis = self.sampler.analyze(Some(&before), &during, Some(&after));

        ExperimentOutcome {
            target: target.clone(),
            state: OutcomeState::Done,
            action_result: ActionResult::succeeded(descriptor.action, platform),
            rollback_result,
            metrics: PhaseMetrics { before: Some(before), during, after: Some(after) },
            analysis,
            phases: phases.finish(Phase::Done),
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// Rollback prefers the platform that applied the fault
    async fn roll_back(&self, target: &Target, platform: &str, rollback: PowerAction, timeout: Duration) -> ActionResult {
        let mut routed = target.clone();
        routed.platform_hint = self.registry.kind_of(platform).or(target.platform_hint);

        match self.registry.perform(&routed, rollback, timeout).await {
            Ok(used) => ActionResult::succeeded(rollback, used),
            Err(e) => {
                error!("{}: rollback {} failed, fault may still be in effect: {}", target.identifier, rollback, e);
                ActionResult::failed(rollback, e.to_failure())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToleranceSettings;
    use crate::errors::{ConnectError, PowerError, SamplingError};
    use crate::metrics::MetricSource;
    use crate::models::{ActionStatus, MetricReading, PlatformKind, RawTargetRecord, TargetKind};
    use crate::platforms::{DiscoveryFilter, PlatformAdapter};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    struct Flaky {
        fail_for: Vec<String>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PlatformAdapter for Flaky {
        fn kind(&self) -> PlatformKind {
            PlatformKind::Vsphere
        }
        async fn connect(&self) -> Result<(), ConnectError> {
            Ok(())
        }
        async fn disconnect(&self) {
            self.calls.lock().push("disconnect".into());
        }
        async fn discover(&self, _filter: &DiscoveryFilter) -> Result<Vec<RawTargetRecord>, ConnectError> {
            Ok(Vec::new())
        }
        async fn power(&self, id: &str, action: PowerAction, _timeout: Duration) -> Result<(), PowerError> {
            self.calls.lock().push(format!("{action}:{id}"));
            if self.fail_for.iter().any(|f| f == id) {
                Err(PowerError::NotFound(id.to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct Steady;

    #[async_trait]
    impl MetricSource for Steady {
        fn name(&self) -> &str {
            "steady"
        }
        async fn sample(&self, _target: &Target) -> Result<MetricReading, SamplingError> {
            Ok(MetricReading { cpu_percent: Some(12.0), memory_percent: Some(30.0), ..Default::default() })
        }
    }

    fn sequencer(fail_for: &[&str]) -> (Sequencer, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PlatformRegistry::new();
        registry.register(Arc::new(Flaky { fail_for: fail_for.iter().map(|s| s.to_string()).collect(), calls: calls.clone() }));
        let sampler = MetricsSampler::new(Some(Arc::new(Steady)), None, Duration::from_secs(5), ToleranceSettings::default());
        (Sequencer::new(Arc::new(registry), Arc::new(sampler), Duration::from_secs(30)), calls)
    }

    fn descriptor(ids: &[&str]) -> ExperimentDescriptor {
        ExperimentDescriptor {
            action: PowerAction::PowerOff { graceful: true },
            rollback: Some(PowerAction::PowerOn),
            duration: Duration::from_secs(10),
            interval: Duration::from_secs(5),
            target_ids: ids.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            dry_run: false,
            action_timeout: None,
        }
    }

    fn inventory(ids: &[&str]) -> Vec<Target> {
        ids.iter().map(|id| Target::new(*id, TargetKind::Vm)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle() {
        let (seq, calls) = sequencer(&[]);
        let batch = seq.run(&descriptor(&["vm1"]), &inventory(&["vm1", "vm2"])).await.unwrap();

        assert_eq!(batch.per_target.len(), 1);
        let outcome = &batch.per_target[0];
        assert_eq!(outcome.state, OutcomeState::Done);
        assert_eq!(outcome.action_result.platform_used.as_deref(), Some("vsphere"));
        assert_eq!(outcome.rollback_result.as_ref().map(|r| r.status), Some(ActionStatus::Succeeded));
        assert_eq!(outcome.metrics.during.len(), 2);
        assert_eq!(outcome.metrics.after.as_ref().map(|s| s.label.as_str()), Some("after"));
        assert!(outcome.analysis["cpu_percent"].recovered);
        assert_eq!(
            outcome.phases,
            vec![
                Phase::Idle,
                Phase::BaselineSampling,
                Phase::Acting,
                Phase::ContinuousSampling,
                Phase::RollingBack,
                Phase::PostSampling,
                Phase::Done
            ]
        );
        assert_eq!(
            *calls.lock(),
            vec!["power_off(graceful=true):vm1", "power_on:vm1", "disconnect"]
        );
        assert_eq!(seq.outcome_log().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_action_skips_remaining_phases() {
        let (seq, calls) = sequencer(&["vm1"]);
        let batch = seq.run(&descriptor(&["vm1", "vm2"]), &inventory(&["vm1", "vm2"])).await.unwrap();

        let failed = &batch.per_target[0];
        assert_eq!(failed.state, OutcomeState::Failed);
        assert!(failed.metrics.during.is_empty());
        assert!(failed.metrics.after.is_none());
        assert!(failed.metrics.before.is_some());
        assert!(failed.rollback_result.is_none());
        assert_eq!(failed.phases.last(), Some(&Phase::Failed));
        let failure = failed.action_result.error.as_ref().unwrap();
        assert_eq!(failure.attempts[0].platform, "vsphere");

        assert_eq!(batch.per_target[1].state, OutcomeState::Done);
        assert!(!calls.lock().iter().any(|c| c == "power_on:vm1"));
    }

    #[tokio::test]
    async fn test_resolution_failure_aborts_batch() {
        let (seq, calls) = sequencer(&[]);
        let err = seq.run(&descriptor(&["vm9"]), &inventory(&["vm1"])).await.unwrap_err();
        assert!(matches!(err, ResolutionError::NoneMatched { .. }));
        assert_eq!(*calls.lock(), vec!["disconnect"]);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let (seq, calls) = sequencer(&[]);
        let mut desc = descriptor(&["vm1"]);
        desc.dry_run = true;
        let batch = seq.run(&desc, &inventory(&["vm1"])).await.unwrap();

        let outcome = &batch.per_target[0];
        assert_eq!(outcome.state, OutcomeState::Done);
        assert_eq!(outcome.action_result.status, ActionStatus::Skipped);
        assert_eq!(outcome.phases, vec![Phase::Idle, Phase::Done]);
        assert_eq!(*calls.lock(), vec!["disconnect"]);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_everything() {
        let (seq, calls) = sequencer(&[]);
        seq.cancellation_token().cancel();
        let batch = seq.run(&descriptor(&["vm1", "vm2"]), &inventory(&["vm1", "vm2"])).await.unwrap();
        assert!(batch.cancelled);
        assert!(batch.per_target.is_empty());
        assert_eq!(batch.skipped_targets, vec!["vm1", "vm2"]);
        assert_eq!(*calls.lock(), vec!["disconnect"]);
    }
}
