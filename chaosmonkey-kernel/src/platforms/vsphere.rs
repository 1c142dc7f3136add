//! vSphere adapter (vCenter REST API)
//!
//! Session lifecycle:
//! - `POST /api/session` with basic auth returns a session token
//! - `GET /api/session` verifies it; on failure the token is released again
//! - `DELETE /api/session` on disconnect
//!
//! Targets are addressed by VM name; the managed object id (`vm-123`) is
//! looked up once and remembered for the lifetime of the adapter.

use super::{
    confirm_session, drive_power, http_client, request_error, DiscoveryFilter, PlatformAdapter, PowerControl, PowerOp,
    PowerTiming, SessionCheck,
};
use crate::config::VsphereSettings;
use crate::errors::{ConnectError, PowerError};
use crate::models::{PlatformKind, PowerAction, PowerState, RawTargetRecord, TargetKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const SESSION_HEADER: &str = "vmware-api-session-id";

#[derive(Clone)]
struct Session {
    client: reqwest::Client,
    base: String,
    token: String,
}

#[async_trait]
impl SessionCheck for Session {
    async fn verify(&self) -> Result<(), ConnectError> {
        let resp = self
            .client
            .get(format!("{}/api/session", self.base))
            .header(SESSION_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| ConnectError::from_transport(&e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ConnectError::Auth(format!("session rejected with {}", resp.status())))
        }
    }

    async fn release(&self) {
        let result = self
            .client
            .delete(format!("{}/api/session", self.base))
            .header(SESSION_HEADER, &self.token)
            .send()
            .await;
        if let Err(e) = result {
            debug!("vsphere: session release failed: {}", e);
        }
    }
}

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    name: String,
    power_state: String,
    #[serde(default)]
    cpu_count: Option<u32>,
    #[serde(default, rename = "memory_size_MiB")]
    memory_size_mib: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DatacenterSummary {
    datacenter: String,
}

#[derive(Debug, Deserialize)]
struct PowerInfo {
    state: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    messages: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    default_message: String,
}

pub(crate) fn parse_power_state(raw: &str) -> PowerState {
    match raw {
        "POWERED_ON" => PowerState::On,
        "POWERED_OFF" => PowerState::Off,
        "SUSPENDED" => PowerState::Suspended,
        _ => PowerState::Unknown,
    }
}

pub struct VsphereAdapter {
    settings: VsphereSettings,
    timing: PowerTiming,
    session: tokio::sync::Mutex<Option<Session>>,
    vm_ids: Mutex<HashMap<String, String>>,
}

impl VsphereAdapter {
    pub fn new(settings: VsphereSettings) -> Self {
        let timing = PowerTiming::from(&settings.timing);
        Self { settings, timing, session: tokio::sync::Mutex::new(None), vm_ids: Mutex::new(HashMap::new()) }
    }

    async fn open_session(&self) -> Result<Session, ConnectError> {
        let (Some(server), Some(username), Some(password)) =
            (&self.settings.server, &self.settings.username, &self.settings.password)
        else {
            return Err(ConnectError::NotConfigured);
        };

        let base = format!("https://{}:{}", server, self.settings.port);
        let client = http_client(&self.settings.timing, self.settings.insecure, None)?;
        let resp = client
            .post(format!("{base}/api/session"))
            .basic_auth(username, Some(password))
            .send()
            .await
            .map_err(|e| ConnectError::from_transport(&e))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ConnectError::Auth(format!("vCenter rejected credentials for {username}")));
        }
        if !status.is_success() {
            return Err(ConnectError::Protocol(format!("session creation returned {status}")));
        }
        let token: String = resp.json().await.map_err(|e| ConnectError::Protocol(e.to_string()))?;
        let session = confirm_session(Session { client, base, token }).await?;
        info!("vsphere: connected to {}", server);
        Ok(session)
    }

    async fn session(&self) -> Result<Session, ConnectError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.open_session().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn list_vms(&self, session: &Session, filter: &DiscoveryFilter) -> Result<Vec<VmSummary>, ConnectError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(dc) = &filter.datacenter {
            let dcs: Vec<DatacenterSummary> = get_json(session, "/api/vcenter/datacenter", &[("names", dc.clone())]).await?;
            match dcs.first() {
                Some(found) => query.push(("datacenters", found.datacenter.clone())),
                None => return Ok(Vec::new()),
            }
        }
        let vms: Vec<VmSummary> = get_json(session, "/api/vcenter/vm", &query).await?;
        Ok(vms.into_iter().filter(|vm| filter.matches_name(&vm.name)).collect())
    }

    async fn vm_id(&self, session: &Session, name: &str) -> Result<String, PowerError> {
        let known = self.vm_ids.lock().get(name).cloned();
        if let Some(id) = known {
            return Ok(id);
        }
        let vms: Vec<VmSummary> = get_json(session, "/api/vcenter/vm", &[("names", name.to_string())]).await?;
        let vm = vms.into_iter().next().ok_or_else(|| PowerError::NotFound(name.to_string()))?;
        self.vm_ids.lock().insert(name.to_string(), vm.vm.clone());
        Ok(vm.vm)
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    session: &Session,
    path: &str,
    query: &[(&str, String)],
) -> Result<T, ConnectError> {
    let resp = session
        .client
        .get(format!("{}{}", session.base, path))
        .header(SESSION_HEADER, &session.token)
        .query(query)
        .send()
        .await
        .map_err(|e| ConnectError::from_transport(&e))?;
    let status = resp.status();
    if status.as_u16() == 401 {
        return Err(ConnectError::Auth("session expired".into()));
    }
    if !status.is_success() {
        return Err(ConnectError::Protocol(format!("GET {path} returned {status}")));
    }
    resp.json().await.map_err(|e| ConnectError::Protocol(e.to_string()))
}

#[async_trait]
impl PowerControl for VsphereAdapter {
    async fn power_state(&self, target_id: &str) -> Result<PowerState, PowerError> {
        let session = self.session().await?;
        let vm = self.vm_id(&session, target_id).await?;
        let info: PowerInfo = get_json(&session, &format!("/api/vcenter/vm/{vm}/power"), &[]).await?;
        Ok(parse_power_state(&info.state))
    }

    async fn request(&self, target_id: &str, op: PowerOp) -> Result<(), PowerError> {
        let session = self.session().await?;
        let vm = self.vm_id(&session, target_id).await?;
        let (path, action) = match op {
            PowerOp::Start => ("power", "start"),
            PowerOp::Stop => ("power", "stop"),
            PowerOp::Reset => ("power", "reset"),
            PowerOp::Shutdown => ("guest/power", "shutdown"),
            PowerOp::GuestReboot => ("guest/power", "reboot"),
        };
        debug!("vsphere: {} {} ({})", action, target_id, vm);

        let resp = session
            .client
            .post(format!("{}/api/vcenter/vm/{}/{}", session.base, vm, path))
            .header(SESSION_HEADER, &session.token)
            .query(&[("action", action)])
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body: Option<ApiError> = resp.json().await.ok();
        let reason = body
            .as_ref()
            .and_then(|b| b.messages.first())
            .map(|m| m.default_message.clone())
            .unwrap_or_else(|| status.to_string());
        let error_type = body.and_then(|b| b.error_type).unwrap_or_default();

        Err(match (status.as_u16(), error_type.as_str()) {
            (404, _) | (_, "NOT_FOUND") => PowerError::NotFound(target_id.to_string()),
            (_, "NOT_ALLOWED_IN_CURRENT_STATE") | (_, "SERVICE_UNAVAILABLE") => {
                PowerError::InvalidTransition { target: target_id.to_string(), reason }
            }
            (401, _) => PowerError::Connect(ConnectError::Auth(reason)),
            _ => PowerError::Request(format!("{action} on {target_id}: {reason}")),
        })
    }
}

#[async_trait]
impl PlatformAdapter for VsphereAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Vsphere
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        self.session().await.map(|_| ())
    }

    async fn disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.release().await;
            info!("vsphere: disconnected");
        }
    }

    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<RawTargetRecord>, ConnectError> {
        let session = self.session().await?;
        let vms = self.list_vms(&session, filter).await?;
        let mut ids = self.vm_ids.lock();
        let records: Vec<RawTargetRecord> = vms
            .into_iter()
            .map(|vm| {
                ids.insert(vm.name.clone(), vm.vm.clone());
                RawTargetRecord {
                    id: vm.name.clone(),
                    name: vm.name,
                    kind: TargetKind::Vm,
                    platform: PlatformKind::Vsphere,
                    power_state: parse_power_state(&vm.power_state),
                    host: None,
                    cpu: vm.cpu_count,
                    memory_mb: vm.memory_size_mib,
                }
            })
            .collect();
        drop(ids);
        debug!("vsphere: discovered {} VMs", records.len());
        Ok(records)
    }

    async fn power(&self, target_id: &str, action: PowerAction, timeout: Duration) -> Result<(), PowerError> {
        info!("vsphere: {} on {}", action, target_id);
        let result = drive_power(self, target_id, action, timeout, self.timing).await;
        if let Err(PowerError::Connect(ConnectError::Auth(_))) = &result {
            warn!("vsphere: session rejected, dropping it");
            self.session.lock().await.take();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_mapping() {
        assert_eq!(parse_power_state("POWERED_ON"), PowerState::On);
        assert_eq!(parse_power_state("POWERED_OFF"), PowerState::Off);
        assert_eq!(parse_power_state("SUSPENDED"), PowerState::Suspended);
        assert_eq!(parse_power_state("weird"), PowerState::Unknown);
    }

    #[test]
    fn test_vm_summary_decoding() {
        let json = r#"[{"vm":"vm-17","name":"web-01","power_state":"POWERED_ON","cpu_count":2,"memory_size_MiB":4096}]"#;
        let vms: Vec<VmSummary> = serde_json::from_str(json).unwrap();
        assert_eq!(vms[0].vm, "vm-17");
        assert_eq!(vms[0].memory_size_mib, Some(4096));
    }

    #[tokio::test]
    async fn test_unconfigured_connect_fails() {
        let adapter = VsphereAdapter::new(VsphereSettings::default());
        assert_eq!(adapter.connect().await, Err(ConnectError::NotConfigured));
        let err = adapter.power("vm1", PowerAction::PowerOn, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, PowerError::Connect(ConnectError::NotConfigured));
        adapter.disconnect().await;
    }
}
