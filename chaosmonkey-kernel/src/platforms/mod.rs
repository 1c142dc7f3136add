//! Platform adapters
//!
//! One adapter per backend, all behind the `PlatformAdapter` capability:
//! - `vsphere`: hypervisor manager (vCenter REST API)
//! - `olvm`: hypervisor manager (oVirt / Oracle Linux Virtualization Manager REST API)
//! - `nomad`: cluster scheduler (nodes are drained instead of powered off)
//!
//! Adapters connect lazily on first use and keep their session until
//! `disconnect()`. Hypervisor adapters share the graceful-to-forced escalation
//! in `drive_power`, expressed against the small `PowerControl` trait.

pub mod nomad;
pub mod olvm;
pub mod vsphere;

use crate::config::{Settings, TimingSettings};
use crate::errors::{ConnectError, PowerError};
use crate::models::{PlatformKind, PowerAction, PowerState, RawTargetRecord};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Discovery query; also part of the inventory cache signature
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryFilter {
    /// Substring match on the target name
    pub name_pattern: Option<String>,
    pub datacenter: Option<String>,
}

impl DiscoveryFilter {
    pub fn signature(&self) -> String {
        match (&self.name_pattern, &self.datacenter) {
            (None, None) => "all".to_string(),
            (name, dc) => format!(
                "name={};dc={}",
                name.as_deref().unwrap_or("*"),
                dc.as_deref().unwrap_or("*")
            ),
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name_pattern.as_deref().map(|p| name.contains(p)).unwrap_or(true)
    }
}

/// Capability interface implemented once per backend
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn kind(&self) -> PlatformKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Establish (or verify) the backend session
    async fn connect(&self) -> Result<(), ConnectError>;

    /// Release the session; safe to call when not connected
    async fn disconnect(&self);

    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<RawTargetRecord>, ConnectError>;

    async fn power(&self, target_id: &str, action: PowerAction, timeout: Duration) -> Result<(), PowerError>;

    /// Join-all over `power`, at most `parallelism` calls in flight
    async fn batch_power(
        &self,
        target_ids: &[String],
        action: PowerAction,
        timeout: Duration,
        parallelism: usize,
    ) -> BTreeMap<String, Result<(), PowerError>> {
        info!(
            "{}: batch {} on {} targets (parallelism {})",
            self.name(),
            action,
            target_ids.len(),
            parallelism.max(1)
        );
        stream::iter(target_ids.iter().cloned())
            .map(|id| async move {
                let result = self.power(&id, action, timeout).await;
                if let Err(e) = &result {
                    warn!("{}: {} failed on {}: {}", self.name(), action, id, e);
                }
                (id, result)
            })
            .buffer_unordered(parallelism.max(1))
            .collect()
            .await
    }
}

/// Backend power primitives used by `drive_power`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOp {
    Start,
    /// Orderly in-guest shutdown
    Shutdown,
    /// Forced power off
    Stop,
    /// Orderly in-guest restart
    GuestReboot,
    /// Forced restart
    Reset,
}

#[async_trait]
pub trait PowerControl: Send + Sync {
    async fn power_state(&self, target_id: &str) -> Result<PowerState, PowerError>;
    async fn request(&self, target_id: &str, op: PowerOp) -> Result<(), PowerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerTiming {
    pub poll_interval: Duration,
    pub forced_timeout: Duration,
}

impl Default for PowerTiming {
    fn default() -> Self {
        Self::from(&TimingSettings::default())
    }
}

impl From<&TimingSettings> for PowerTiming {
    fn from(settings: &TimingSettings) -> Self {
        Self {
            poll_interval: Duration::from_secs(settings.poll_interval_secs.max(1)),
            forced_timeout: Duration::from_secs(settings.forced_timeout_secs),
        }
    }
}

/// Poll until `desired` is observed or `limit` elapses
async fn wait_for_state<C: PowerControl + ?Sized>(
    control: &C,
    target_id: &str,
    desired: PowerState,
    limit: Duration,
    poll: Duration,
) -> Result<bool, PowerError> {
    let deadline = Instant::now() + limit;
    loop {
        match control.power_state(target_id).await {
            Ok(state) if state == desired => return Ok(true),
            Ok(_) => {}
            Err(PowerError::Request(reason)) => debug!("{}: state poll failed, retrying: {}", target_id, reason),
            Err(e) => return Err(e),
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

/// Apply a power action with graceful-to-forced escalation
///
/// Graceful power-off sends the orderly request and waits up to `timeout`; if
/// the target is still running it sends exactly one forced request and waits
/// up to `min(timeout, forced_timeout)`. A refused orderly request escalates
/// immediately. Actions already satisfied are no-ops.
pub async fn drive_power<C: PowerControl + ?Sized>(
    control: &C,
    target_id: &str,
    action: PowerAction,
    timeout: Duration,
    timing: PowerTiming,
) -> Result<(), PowerError> {
    let current = control.power_state(target_id).await?;
    let poll = timing.poll_interval;

    match action {
        PowerAction::PowerOn => {
            if current == PowerState::On {
                debug!("{} already running", target_id);
                return Ok(());
            }
            control.request(target_id, PowerOp::Start).await?;
            expect_state(control, target_id, PowerState::On, timeout, poll).await
        }
        PowerAction::PowerOff { graceful } => {
            if current == PowerState::Off {
                debug!("{} already powered off", target_id);
                return Ok(());
            }
            let forced_wait = if graceful {
                match control.request(target_id, PowerOp::Shutdown).await {
                    Ok(()) => {
                        if wait_for_state(control, target_id, PowerState::Off, timeout, poll).await? {
                            return Ok(());
                        }
                        warn!("{} still running after graceful shutdown ({:?}), forcing power off", target_id, timeout);
                    }
                    Err(e) => warn!("{} refused graceful shutdown ({}), forcing power off", target_id, e),
                }
                timeout.min(timing.forced_timeout)
            } else {
                timeout
            };
            escalate(control, target_id, PowerOp::Stop, PowerState::Off, forced_wait, poll, graceful).await
        }
        PowerAction::Reboot { graceful } => {
            if current != PowerState::On {
                info!("{} is not running ({:?}), starting instead of rebooting", target_id, current);
                control.request(target_id, PowerOp::Start).await?;
                return expect_state(control, target_id, PowerState::On, timeout, poll).await;
            }
            if graceful {
                match control.request(target_id, PowerOp::GuestReboot).await {
                    Ok(()) => return expect_state(control, target_id, PowerState::On, timeout, poll).await,
                    Err(e) => warn!("{} refused guest reboot ({}), resetting", target_id, e),
                }
            }
            let wait = if graceful { timeout.min(timing.forced_timeout) } else { timeout };
            escalate(control, target_id, PowerOp::Reset, PowerState::On, wait, poll, graceful).await
        }
    }
}

async fn expect_state<C: PowerControl + ?Sized>(
    control: &C,
    target_id: &str,
    desired: PowerState,
    limit: Duration,
    poll: Duration,
) -> Result<(), PowerError> {
    if wait_for_state(control, target_id, desired, limit, poll).await? {
        Ok(())
    } else {
        Err(PowerError::Timeout { target: target_id.to_string(), desired: format!("{desired:?}"), waited: limit })
    }
}

/// Forced request followed by a bounded wait
async fn escalate<C: PowerControl + ?Sized>(
    control: &C,
    target_id: &str,
    op: PowerOp,
    desired: PowerState,
    limit: Duration,
    poll: Duration,
    after_graceful: bool,
) -> Result<(), PowerError> {
    let fallback_failed = |reason: String| PowerError::ForcedFallbackFailed { target: target_id.to_string(), reason };

    if let Err(e) = control.request(target_id, op).await {
        return Err(if after_graceful { fallback_failed(e.to_string()) } else { e });
    }
    match wait_for_state(control, target_id, desired, limit, poll).await {
        Ok(true) => Ok(()),
        Ok(false) if after_graceful => Err(fallback_failed(format!("not {desired:?} after {limit:?}"))),
        Ok(false) => Err(PowerError::Timeout { target: target_id.to_string(), desired: format!("{desired:?}"), waited: limit }),
        Err(e) if after_graceful => Err(fallback_failed(e.to_string())),
        Err(e) => Err(e),
    }
}

/// Build one adapter per entry of `platforms.order`
///
/// Unconfigured backends are still listed; they fail `connect` with
/// `ConnectError::NotConfigured` so the registry reports them.
pub fn build_adapters(settings: &Settings) -> Vec<Arc<dyn PlatformAdapter>> {
    let mut adapters: Vec<Arc<dyn PlatformAdapter>> = Vec::new();
    for kind in &settings.platforms.order {
        if adapters.iter().any(|a| a.kind() == *kind) {
            warn!("platform {} listed twice in platforms.order, ignoring duplicate", kind);
            continue;
        }
        let adapter: Arc<dyn PlatformAdapter> = match kind {
            PlatformKind::Vsphere => Arc::new(vsphere::VsphereAdapter::new(settings.platforms.vsphere.clone())),
            PlatformKind::Olvm => Arc::new(olvm::OlvmAdapter::new(settings.platforms.olvm.clone())),
            PlatformKind::Nomad => Arc::new(nomad::NomadAdapter::new(settings.platforms.nomad.clone())),
        };
        adapters.push(adapter);
    }
    adapters
}

/// Shared reqwest client setup for backend APIs; `root_ca` is trusted in
/// addition to the system roots
pub(crate) fn http_client(
    timing: &TimingSettings,
    insecure: bool,
    root_ca: Option<reqwest::Certificate>,
) -> Result<reqwest::Client, ConnectError> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(timing.request_timeout_secs.max(1)))
        .danger_accept_invalid_certs(insecure);
    if let Some(cert) = root_ca {
        builder = builder.add_root_certificate(cert);
    }
    builder.build().map_err(|e| ConnectError::Protocol(format!("cannot build HTTP client: {e}")))
}

/// PEM certificate authority file for a backend with a private CA
pub(crate) async fn read_ca_certificate(path: &Path) -> Result<reqwest::Certificate, ConnectError> {
    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| ConnectError::Protocol(format!("cannot read CA file {}: {e}", path.display())))?;
    reqwest::Certificate::from_pem(&pem)
        .map_err(|e| ConnectError::Protocol(format!("invalid CA file {}: {e}", path.display())))
}

/// Freshly opened backend session that must be checked before use
#[async_trait]
pub(crate) trait SessionCheck: Send + Sync {
    async fn verify(&self) -> Result<(), ConnectError>;
    /// Give the session back to the backend; failures are only logged
    async fn release(&self);
}

/// A session that fails verification is released before the error is returned
pub(crate) async fn confirm_session<S: SessionCheck>(session: S) -> Result<S, ConnectError> {
    if let Err(e) = session.verify().await {
        session.release().await;
        return Err(e);
    }
    Ok(session)
}

/// Flatten a transport error raised during a power call
pub(crate) fn request_error(err: reqwest::Error) -> PowerError {
    match ConnectError::from_transport(&err) {
        ConnectError::Protocol(reason) => PowerError::Request(reason),
        other => PowerError::Connect(other),
    }
}
