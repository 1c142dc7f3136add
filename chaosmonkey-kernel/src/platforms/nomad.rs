//! Nomad adapter (cluster scheduler)
//!
//! Nodes are the only power-controllable targets:
//! - power off: drain (graceful uses the configured deadline, forced drains immediately)
//!   and mark ineligible
//! - power on: cancel the drain and mark eligible again
//! - reboot: drain then restore eligibility
//!
//! A node counts as `On` when it is ready, eligible and not draining. Jobs and
//! services are discovered for targeting and metrics only.

use super::{drive_power, DiscoveryFilter, PlatformAdapter, PowerControl, PowerOp, PowerTiming};
use crate::config::NomadSettings;
use crate::errors::{ConnectError, PowerError};
use crate::models::{PlatformKind, PowerAction, PowerState, RawTargetRecord, TargetKind};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Thin client over the Nomad HTTP API, shared with the Nomad metric source
#[derive(Clone)]
pub struct NomadApi {
    client: reqwest::Client,
    address: String,
    token: Option<String>,
    region: Option<String>,
    namespace: Option<String>,
}

impl NomadApi {
    pub fn from_settings(settings: &NomadSettings) -> Result<Self, ConnectError> {
        let address = settings.address.clone().ok_or(ConnectError::NotConfigured)?;
        Ok(Self {
            client: super::http_client(&settings.timing, false, None)?,
            address: address.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            region: settings.region.clone(),
            namespace: settings.namespace.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{}", self.address, path));
        if let Some(token) = &self.token {
            builder = builder.header("X-Nomad-Token", token);
        }
        let mut query = Vec::new();
        if let Some(region) = &self.region {
            query.push(("region", region.as_str()));
        }
        if let Some(namespace) = &self.namespace {
            query.push(("namespace", namespace.as_str()));
        }
        builder.query(&query)
    }

    /// `Ok(None)` on 404
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ConnectError> {
        let resp = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|e| ConnectError::from_transport(&e))?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ConnectError::Auth(format!("GET {path} returned {status}")));
        }
        if !status.is_success() {
            return Err(ConnectError::Protocol(format!("GET {path} returned {status}")));
        }
        resp.json().await.map(Some).map_err(|e| ConnectError::Protocol(e.to_string()))
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<(), PowerError> {
        let resp = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(super::request_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let reason = resp.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            404 => PowerError::NotFound(path.to_string()),
            401 | 403 => PowerError::Connect(ConnectError::Auth(reason)),
            _ => PowerError::Request(format!("POST {path} returned {status}: {}", reason.trim())),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeStub {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    #[serde(default)]
    datacenter: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    scheduling_eligibility: String,
    #[serde(default)]
    drain: bool,
    #[serde(default)]
    address: Option<String>,
}

impl NodeStub {
    fn power_state(&self) -> PowerState {
        node_power_state(&self.status, &self.scheduling_eligibility, self.drain)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobStub {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    #[serde(rename = "Type", default)]
    job_type: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    datacenters: Vec<String>,
}

pub(crate) fn node_power_state(status: &str, eligibility: &str, draining: bool) -> PowerState {
    match status {
        "down" => PowerState::Off,
        "ready" if eligibility == "eligible" && !draining => PowerState::On,
        "ready" => PowerState::Off,
        _ => PowerState::Unknown,
    }
}

fn job_power_state(status: &str) -> PowerState {
    match status {
        "running" => PowerState::On,
        "dead" => PowerState::Off,
        _ => PowerState::Unknown,
    }
}

fn drain_body(deadline: Option<Duration>) -> Value {
    match deadline {
        Some(deadline) => json!({
            "DrainSpec": { "Deadline": deadline.as_nanos() as u64, "IgnoreSystemJobs": false },
            "MarkEligible": false
        }),
        // negative deadline forces an immediate drain
        None => json!({
            "DrainSpec": { "Deadline": -1, "IgnoreSystemJobs": false },
            "MarkEligible": false
        }),
    }
}

pub struct NomadAdapter {
    settings: NomadSettings,
    timing: PowerTiming,
    api: Option<NomadApi>,
    connected: AtomicBool,
}

impl NomadAdapter {
    pub fn new(settings: NomadSettings) -> Self {
        let timing = PowerTiming::from(&settings.timing);
        let api = NomadApi::from_settings(&settings).ok();
        Self { settings, timing, api, connected: AtomicBool::new(false) }
    }

    async fn api(&self) -> Result<&NomadApi, ConnectError> {
        let api = self.api.as_ref().ok_or(ConnectError::NotConfigured)?;
        if !self.connected.load(Ordering::Acquire) {
            api.get::<Value>("/v1/agent/self")
                .await?
                .ok_or_else(|| ConnectError::Protocol("agent endpoint not found".into()))?;
            self.connected.store(true, Ordering::Release);
            info!("nomad: connected to {}", api.address);
        }
        Ok(api)
    }

    async fn list_nodes(&self, api: &NomadApi) -> Result<Vec<NodeStub>, ConnectError> {
        Ok(api.get::<Vec<NodeStub>>("/v1/nodes").await?.unwrap_or_default())
    }

    /// Accepts a node ID or a node name
    async fn find_node(&self, api: &NomadApi, target_id: &str) -> Result<NodeStub, PowerError> {
        if let Some(node) = api.get::<NodeStub>(&format!("/v1/node/{target_id}")).await? {
            return Ok(node);
        }
        if let Some(node) = self.list_nodes(api).await?.into_iter().find(|n| n.name == target_id) {
            return Ok(node);
        }
        if api.get::<Value>(&format!("/v1/job/{target_id}")).await?.is_some() {
            return Err(PowerError::InvalidTransition {
                target: target_id.to_string(),
                reason: "jobs cannot be power-controlled, only nodes".into(),
            });
        }
        Err(PowerError::NotFound(target_id.to_string()))
    }

    async fn restore(&self, api: &NomadApi, node_id: &str) -> Result<(), PowerError> {
        api.post(&format!("/v1/node/{node_id}/drain"), &json!({ "DrainSpec": null, "MarkEligible": true }))
            .await?;
        api.post(&format!("/v1/node/{node_id}/eligibility"), &json!({ "Eligibility": "eligible" }))
            .await
    }
}

#[async_trait]
impl PowerControl for NomadAdapter {
    async fn power_state(&self, target_id: &str) -> Result<PowerState, PowerError> {
        let api = self.api().await?;
        Ok(self.find_node(api, target_id).await?.power_state())
    }

    async fn request(&self, target_id: &str, op: PowerOp) -> Result<(), PowerError> {
        let api = self.api().await?;
        let node = self.find_node(api, target_id).await?;
        let drain_path = format!("/v1/node/{}/drain", node.id);
        let graceful_deadline = Some(Duration::from_secs(self.settings.drain_deadline_secs));
        debug!("nomad: {:?} on node {} ({})", op, node.name, node.id);

        match op {
            PowerOp::Shutdown => api.post(&drain_path, &drain_body(graceful_deadline)).await,
            PowerOp::Stop => api.post(&drain_path, &drain_body(None)).await,
            PowerOp::Start => self.restore(api, &node.id).await,
            PowerOp::GuestReboot => {
                api.post(&drain_path, &drain_body(graceful_deadline)).await?;
                self.restore(api, &node.id).await
            }
            PowerOp::Reset => {
                api.post(&drain_path, &drain_body(None)).await?;
                self.restore(api, &node.id).await
            }
        }
    }
}

#[async_trait]
impl PlatformAdapter for NomadAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Nomad
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        self.api().await.map(|_| ())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!("nomad: disconnected");
        }
    }

    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<RawTargetRecord>, ConnectError> {
        let api = self.api().await?;
        let in_dc = |dc: &str| filter.datacenter.as_deref().map(|want| want == dc).unwrap_or(true);

        let mut records: Vec<RawTargetRecord> = self
            .list_nodes(api)
            .await?
            .into_iter()
            .filter(|n| filter.matches_name(&n.name) && in_dc(n.datacenter.as_str()))
            .map(|n| RawTargetRecord {
                power_state: n.power_state(),
                id: n.id,
                name: n.name,
                kind: TargetKind::Node,
                platform: PlatformKind::Nomad,
                host: n.address,
                cpu: None,
                memory_mb: None,
            })
            .collect();

        let jobs = api.get::<Vec<JobStub>>("/v1/jobs").await?.unwrap_or_default();
        records.extend(
            jobs.into_iter()
                .filter(|j| filter.matches_name(&j.name))
                .filter(|j| j.datacenters.is_empty() || j.datacenters.iter().any(|dc| in_dc(dc.as_str())))
                .map(|j| RawTargetRecord {
                    power_state: job_power_state(&j.status),
                    kind: if j.job_type == "service" { TargetKind::Service } else { TargetKind::Job },
                    id: j.id,
                    name: j.name,
                    platform: PlatformKind::Nomad,
                    host: None,
                    cpu: None,
                    memory_mb: None,
                }),
        );
        debug!("nomad: discovered {} nodes and jobs", records.len());
        Ok(records)
    }

    async fn power(&self, target_id: &str, action: PowerAction, timeout: Duration) -> Result<(), PowerError> {
        info!("nomad: {} on {}", action, target_id);
        drive_power(self, target_id, action, timeout, self.timing).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_power_state() {
        assert_eq!(node_power_state("ready", "eligible", false), PowerState::On);
        assert_eq!(node_power_state("ready", "ineligible", false), PowerState::Off);
        assert_eq!(node_power_state("ready", "eligible", true), PowerState::Off);
        assert_eq!(node_power_state("down", "eligible", false), PowerState::Off);
        assert_eq!(node_power_state("initializing", "eligible", false), PowerState::Unknown);
    }

    #[test]
    fn test_drain_body() {
        let graceful = drain_body(Some(Duration::from_secs(60)));
        assert_eq!(graceful["DrainSpec"]["Deadline"], json!(60_000_000_000u64));
        assert_eq!(graceful["MarkEligible"], json!(false));
        assert_eq!(drain_body(None)["DrainSpec"]["Deadline"], json!(-1));
    }

    #[test]
    fn test_node_stub_decoding() {
        let json = r#"[{"ID":"f7476465","Name":"worker-1","Datacenter":"dc1","Status":"ready",
                        "SchedulingEligibility":"eligible","Drain":false,"Address":"10.0.0.5"}]"#;
        let nodes: Vec<NodeStub> = serde_json::from_str(json).unwrap();
        assert_eq!(nodes[0].id, "f7476465");
        assert_eq!(nodes[0].address.as_deref(), Some("10.0.0.5"));
        assert_eq!(nodes[0].power_state(), PowerState::On);
    }

    #[tokio::test]
    async fn test_without_address_is_not_configured() {
        let settings = NomadSettings { address: None, ..Default::default() };
        let adapter = NomadAdapter::new(settings);
        assert_eq!(adapter.connect().await, Err(ConnectError::NotConfigured));
    }
}
