//! OLVM / oVirt adapter (engine REST API, JSON representation)
//!
//! Authentication goes through the engine SSO endpoint
//! (`<engine>/sso/oauth/token`, password grant, `ovirt-app-api` scope) and the
//! bearer token is revoked on disconnect. VMs are addressed by name and looked
//! up with the engine search syntax.

use super::{
    confirm_session, drive_power, http_client, read_ca_certificate, request_error, DiscoveryFilter, PlatformAdapter,
    PowerControl, PowerOp, PowerTiming, SessionCheck,
};
use crate::config::OlvmSettings;
use crate::errors::{ConnectError, PowerError};
use crate::models::{PlatformKind, PowerAction, PowerState, RawTargetRecord, TargetKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone)]
struct Session {
    client: reqwest::Client,
    api: String,
    engine: String,
    token: String,
}

#[async_trait]
impl SessionCheck for Session {
    async fn verify(&self) -> Result<(), ConnectError> {
        let resp = self
            .client
            .get(&self.api)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ConnectError::from_transport(&e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ConnectError::Auth(format!("engine API rejected token with {}", resp.status())))
        }
    }

    async fn release(&self) {
        let result = self
            .client
            .post(format!("{}/sso/oauth/revoke", self.engine))
            .form(&[("token", self.token.as_str())])
            .send()
            .await;
        if let Err(e) = result {
            debug!("olvm: token revoke failed: {}", e);
        }
    }
}

impl Session {
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ConnectError> {
        let resp = self
            .client
            .get(format!("{}{}", self.api, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| ConnectError::from_transport(&e))?;
        let status = resp.status();
        if status.as_u16() == 401 {
            return Err(ConnectError::Auth("token expired".into()));
        }
        if !status.is_success() {
            return Err(ConnectError::Protocol(format!("GET {path} returned {status}")));
        }
        resp.json().await.map_err(|e| ConnectError::Protocol(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// oVirt VM representation; numeric fields arrive as strings
#[derive(Debug, Deserialize)]
struct Vm {
    id: String,
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    memory: Option<Value>,
    #[serde(default)]
    cpu: Option<Value>,
    #[serde(default)]
    host: Option<Value>,
}

impl Vm {
    fn cpu_count(&self) -> Option<u32> {
        let topology = self.cpu.as_ref()?.get("topology")?;
        let field = |name: &str| topology.get(name).and_then(as_u64).unwrap_or(1);
        u32::try_from(field("sockets") * field("cores") * field("threads")).ok()
    }

    fn memory_mb(&self) -> Option<u64> {
        self.memory.as_ref().and_then(as_u64).map(|bytes| bytes / (1024 * 1024))
    }

    fn host_id(&self) -> Option<String> {
        self.host.as_ref()?.get("id")?.as_str().map(str::to_string)
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn parse_vms(body: Value) -> Result<Vec<Vm>, ConnectError> {
    match body.get("vm") {
        Some(list) => serde_json::from_value(list.clone()).map_err(|e| ConnectError::Protocol(e.to_string())),
        None => Ok(Vec::new()),
    }
}

pub(crate) fn parse_status(raw: &str) -> PowerState {
    match raw {
        "up" => PowerState::On,
        "down" => PowerState::Off,
        "suspended" | "paused" => PowerState::Suspended,
        _ => PowerState::Unknown,
    }
}

/// Engine base URL derived from the API URL (`.../ovirt-engine/api` -> `.../ovirt-engine`)
fn engine_base(api: &str) -> String {
    let trimmed = api.trim_end_matches('/');
    trimmed.strip_suffix("/api").unwrap_or(trimmed).to_string()
}

fn search_expression(filter: &DiscoveryFilter) -> Option<String> {
    let mut terms = Vec::new();
    if let Some(name) = &filter.name_pattern {
        terms.push(format!("name=*{name}*"));
    }
    if let Some(dc) = &filter.datacenter {
        terms.push(format!("datacenter={dc}"));
    }
    (!terms.is_empty()).then(|| terms.join(" and "))
}

pub struct OlvmAdapter {
    settings: OlvmSettings,
    timing: PowerTiming,
    session: tokio::sync::Mutex<Option<Session>>,
    vm_ids: Mutex<HashMap<String, String>>,
}

impl OlvmAdapter {
    pub fn new(settings: OlvmSettings) -> Self {
        let timing = PowerTiming::from(&settings.timing);
        Self { settings, timing, session: tokio::sync::Mutex::new(None), vm_ids: Mutex::new(HashMap::new()) }
    }

    async fn build_client(&self) -> Result<reqwest::Client, ConnectError> {
        let root_ca = match &self.settings.ca_file {
            Some(path) => Some(read_ca_certificate(path).await?),
            None => None,
        };
        http_client(&self.settings.timing, self.settings.insecure, root_ca)
    }

    async fn open_session(&self) -> Result<Session, ConnectError> {
        let (Some(url), Some(username), Some(password)) =
            (&self.settings.url, &self.settings.username, &self.settings.password)
        else {
            return Err(ConnectError::NotConfigured);
        };

        let client = self.build_client().await?;
        let api = url.trim_end_matches('/').to_string();
        let engine = engine_base(&api);
        let resp = client
            .post(format!("{engine}/sso/oauth/token"))
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "password"),
                ("scope", "ovirt-app-api"),
                ("username", username.as_str()),
                ("password", password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ConnectError::from_transport(&e))?;

        let status = resp.status();
        if status.is_client_error() {
            return Err(ConnectError::Auth(format!("engine SSO rejected {username} ({status})")));
        }
        if !status.is_success() {
            return Err(ConnectError::Protocol(format!("SSO token request returned {status}")));
        }
        let token: TokenResponse = resp.json().await.map_err(|e| ConnectError::Protocol(e.to_string()))?;
        let session = confirm_session(Session { client, api, engine, token: token.access_token }).await?;
        info!("olvm: connected to {}", session.api);
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

    async fn vm_id(&self, session: &Session, name: &str) -> Result<String, PowerError> {
        let known = self.vm_ids.lock().get(name).cloned();
        if let Some(id) = known {
            return Ok(id);
        }
        let body = session.get("/vms", &[("search", format!("name={name}"))]).await?;
        let vm = parse_vms(body)?
            .into_iter()
            .find(|vm| vm.name == name)
            .ok_or_else(|| PowerError::NotFound(name.to_string()))?;
        self.vm_ids.lock().insert(name.to_string(), vm.id.clone());
        Ok(vm.id)
    }
}

#[async_trait]
impl PowerControl for OlvmAdapter {
    async fn power_state(&self, target_id: &str) -> Result<PowerState, PowerError> {
        let session = self.session().await?;
        let id = self.vm_id(&session, target_id).await?;
        let body = session.get(&format!("/vms/{id}"), &[]).await?;
        Ok(body.get("status").and_then(Value::as_str).map(parse_status).unwrap_or(PowerState::Unknown))
    }

    async fn request(&self, target_id: &str, op: PowerOp) -> Result<(), PowerError> {
        let session = self.session().await?;
        let id = self.vm_id(&session, target_id).await?;
        let verb = match op {
            PowerOp::Start => "start",
            PowerOp::Shutdown => "shutdown",
            PowerOp::Stop => "stop",
            PowerOp::GuestReboot => "reboot",
            PowerOp::Reset => "reset",
        };
        debug!("olvm: {} {} ({})", verb, target_id, id);

        let resp = session
            .client
            .post(format!("{}/vms/{}/{}", session.api, id, verb))
            .bearer_auth(&session.token)
            .header("Accept", "application/json")
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let fault: Value = resp.json().await.unwrap_or(Value::Null);
        let reason = fault
            .get("detail")
            .or_else(|| fault.get("reason"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string());

        Err(match status.as_u16() {
            404 => PowerError::NotFound(target_id.to_string()),
            400 | 409 => PowerError::InvalidTransition { target: target_id.to_string(), reason },
            401 => PowerError::Connect(ConnectError::Auth(reason)),
            _ => PowerError::Request(format!("{verb} on {target_id}: {reason}")),
        })
    }
}

#[async_trait]
impl PlatformAdapter for OlvmAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Olvm
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        self.session().await.map(|_| ())
    }

    async fn disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.release().await;
            info!("olvm: disconnected");
        }
    }

    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<RawTargetRecord>, ConnectError> {
        let session = self.session().await?;
        let query: Vec<(&str, String)> = search_expression(filter).map(|s| vec![("search", s)]).unwrap_or_default();
        let vms = parse_vms(session.get("/vms", &query).await?)?;

        let records: Vec<RawTargetRecord> = vms
            .into_iter()
            .filter(|vm| filter.matches_name(&vm.name))
            .map(|vm| RawTargetRecord {
                power_state: vm.status.as_deref().map(parse_status).unwrap_or(PowerState::Unknown),
                host: vm.host_id(),
                cpu: vm.cpu_count(),
                memory_mb: vm.memory_mb(),
                kind: TargetKind::Vm,
                platform: PlatformKind::Olvm,
                id: vm.name.clone(),
                name: vm.name,
            })
            .collect();
        debug!("olvm: discovered {} VMs", records.len());
        Ok(records)
    }

    async fn power(&self, target_id: &str, action: PowerAction, timeout: Duration) -> Result<(), PowerError> {
        info!("olvm: {} on {}", action, target_id);
        drive_power(self, target_id, action, timeout, self.timing).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_base() {
        assert_eq!(engine_base("https://olvm.lab/ovirt-engine/api"), "https://olvm.lab/ovirt-engine");
        assert_eq!(engine_base("https://olvm.lab/ovirt-engine/api/"), "https://olvm.lab/ovirt-engine");
    }

    #[test]
    fn test_vm_decoding_with_string_numbers() {
        let body = serde_json::json!({
            "vm": [{
                "id": "123e4567",
                "name": "db-01",
                "status": "up",
                "memory": "8589934592",
                "cpu": { "topology": { "sockets": "2", "cores": "2", "threads": "1" } },
                "host": { "id": "host-9" }
            }]
        });
        let vms = parse_vms(body).unwrap();
        assert_eq!(vms[0].memory_mb(), Some(8192));
        assert_eq!(vms[0].cpu_count(), Some(4));
        assert_eq!(vms[0].host_id().as_deref(), Some("host-9"));
        assert_eq!(parse_status(vms[0].status.as_deref().unwrap()), PowerState::On);
    }

    #[test]
    fn test_empty_listing() {
        assert!(parse_vms(serde_json::json!({})).unwrap().is_empty());
    }

    #[test]
    fn test_search_expression() {
        assert_eq!(search_expression(&DiscoveryFilter::default()), None);
        let filter = DiscoveryFilter { name_pattern: Some("web".into()), datacenter: Some("dc1".into()) };
        assert_eq!(search_expression(&filter).as_deref(), Some("name=*web* and datacenter=dc1"));
    }

    #[tokio::test]
    async fn test_missing_credentials_is_not_configured() {
        let settings = OlvmSettings { url: Some("https://olvm.lab/ovirt-engine/api".into()), ..Default::default() };
        let adapter = OlvmAdapter::new(settings);
        assert_eq!(adapter.connect().await, Err(ConnectError::NotConfigured));
    }
}
