//! Configuration loading
//!
//! Lookup order for the settings file:
//! - explicit path given on the command line
//! - `CHAOSMONKEY_CONFIG` environment variable
//! - `chaosmonkey.yaml`, `chaosmonkey.yml`, `chaosmonkey.json` in the working directory
//! - built-in defaults when none exists
//!
//! Backend credentials left empty in the file are filled from the usual
//! environment variables (`VSPHERE_*`, `OLVM_*`, `NOMAD_*`, `PROMETHEUS_*`).

use crate::models::PlatformKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const DEFAULT_FILES: [&str; 3] = ["chaosmonkey.yaml", "chaosmonkey.yml", "chaosmonkey.json"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub platforms: PlatformSettings,
    pub prometheus: PrometheusSettings,
    pub cache: CacheSettings,
    pub experiment: ExperimentSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    /// Fallback chain, tried in this order
    pub order: Vec<PlatformKind>,
    pub vsphere: VsphereSettings,
    pub olvm: OlvmSettings,
    pub nomad: NomadSettings,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            order: vec![PlatformKind::Vsphere, PlatformKind::Olvm, PlatformKind::Nomad],
            vsphere: VsphereSettings::default(),
            olvm: OlvmSettings::default(),
            nomad: NomadSettings::default(),
        }
    }
}

/// Polling and escalation timing of one adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub poll_interval_secs: u64,
    /// Upper bound of the second wait after the forced request
    pub forced_timeout_secs: u64,
    /// Timeout of every HTTP request sent to the backend
    pub request_timeout_secs: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self { poll_interval_secs: 2, forced_timeout_secs: 180, request_timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VsphereSettings {
    pub server: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub port: u16,
    pub insecure: bool,
    pub timing: TimingSettings,
}

impl Default for VsphereSettings {
    fn default() -> Self {
        Self { server: None, username: None, password: None, port: 443, insecure: true, timing: TimingSettings::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OlvmSettings {
    /// Engine API URL, e.g. `https://olvm.example.com/ovirt-engine/api`
    pub url: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub ca_file: Option<PathBuf>,
    pub insecure: bool,
    pub timing: TimingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NomadSettings {
    pub address: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub region: Option<String>,
    pub namespace: Option<String>,
    /// Drain deadline used for graceful node power-off
    pub drain_deadline_secs: u64,
    pub timing: TimingSettings,
}

impl Default for NomadSettings {
    fn default() -> Self {
        Self {
            address: Some("http://127.0.0.1:4646".into()),
            token: None,
            region: None,
            namespace: None,
            drain_deadline_secs: 300,
            timing: TimingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusSettings {
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub exporter_port: u16,
    /// Suffixes tried after the short hostname when resolving an instance
    pub domain_suffixes: Vec<String>,
}

impl Default for PrometheusSettings {
    fn default() -> Self {
        Self { url: None, timeout_secs: 10, exporter_port: 9100, domain_suffixes: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub list_ttl_secs: u64,
    pub record_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { enabled: true, list_ttl_secs: 60, record_ttl_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentSettings {
    pub action_timeout_secs: u64,
    pub batch_parallelism: usize,
    pub sample_timeout_secs: u64,
    pub tolerance: ToleranceSettings,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            action_timeout_secs: 300,
            batch_parallelism: 5,
            sample_timeout_secs: 10,
            tolerance: ToleranceSettings::default(),
        }
    }
}

/// How close `after` must be to `before` for a metric to count as recovered
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToleranceSettings {
    /// Absolute percentage points
    pub cpu_points: f64,
    /// Absolute percentage points
    pub memory_points: f64,
    /// Fraction of the baseline value
    pub disk_ratio: f64,
}

impl Default for ToleranceSettings {
    fn default() -> Self {
        Self { cpu_points: 5.0, memory_points: 10.0, disk_ratio: 0.10 }
    }
}

impl Settings {
    /// Fill unset fields from a variable lookup (the process environment in production)
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let fill = |slot: &mut Option<String>, var: &str| {
            if slot.is_none() {
                *slot = lookup(var).filter(|v| !v.is_empty());
            }
        };

        let vs = &mut self.platforms.vsphere;
        fill(&mut vs.server, "VSPHERE_SERVER");
        fill(&mut vs.username, "VSPHERE_USERNAME");
        fill(&mut vs.password, "VSPHERE_PASSWORD");
        if let Some(port) = lookup("VSPHERE_PORT").and_then(|p| p.parse().ok()) {
            vs.port = port;
        }
        if let Some(flag) = lookup("VSPHERE_INSECURE") {
            vs.insecure = parse_flag(&flag);
        }

        let olvm = &mut self.platforms.olvm;
        fill(&mut olvm.url, "OLVM_URL");
        fill(&mut olvm.username, "OLVM_USERNAME");
        fill(&mut olvm.password, "OLVM_PASSWORD");
        if olvm.ca_file.is_none() {
            olvm.ca_file = lookup("OLVM_CA_FILE").filter(|v| !v.is_empty()).map(PathBuf::from);
        }
        if let Some(flag) = lookup("OLVM_INSECURE") {
            olvm.insecure = parse_flag(&flag);
        }

        let nomad = &mut self.platforms.nomad;
        if let Some(addr) = lookup("NOMAD_ADDR").filter(|v| !v.is_empty()) {
            nomad.address = Some(addr);
        }
        fill(&mut nomad.token, "NOMAD_TOKEN");
        fill(&mut nomad.region, "NOMAD_REGION");
        fill(&mut nomad.namespace, "NOMAD_NAMESPACE");

        fill(&mut self.prometheus.url, "PROMETHEUS_URL");
        if let Some(timeout) = lookup("PROMETHEUS_TIMEOUT").and_then(|t| t.parse().ok()) {
            self.prometheus.timeout_secs = timeout;
        }
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|var| std::env::var(var).ok());
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Parse a settings document, JSON when the path says so, YAML otherwise
pub fn parse_settings(path: &Path, text: &str) -> Result<Settings> {
    if text.trim().is_empty() {
        return Ok(Settings::default());
    }
    let is_json = path.extension().map(|ext| ext == "json").unwrap_or(false);
    if is_json {
        serde_json::from_str(text).with_context(|| format!("invalid JSON settings in {}", path.display()))
    } else {
        serde_yaml::from_str(text).with_context(|| format!("invalid YAML settings in {}", path.display()))
    }
}

fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var("CHAOSMONKEY_CONFIG") {
        return Some(PathBuf::from(path));
    }
    DEFAULT_FILES.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Load settings from disk (or defaults) and apply environment overrides
pub async fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    let mut settings = match locate(explicit) {
        Some(path) => {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("cannot read settings file {}", path.display()))?;
            info!("loaded settings from {}", path.display());
            parse_settings(&path, &text)?
        }
        None => {
            debug!("no settings file found, using defaults");
            Settings::default()
        }
    };
    settings.apply_env();
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.cache.list_ttl_secs, 60);
        assert_eq!(settings.cache.record_ttl_secs, 300);
        assert_eq!(settings.platforms.vsphere.port, 443);
        assert!(settings.platforms.vsphere.insecure);
        assert_eq!(settings.platforms.olvm.timing.forced_timeout_secs, 180);
        assert_eq!(settings.experiment.batch_parallelism, 5);
        assert_eq!(settings.prometheus.exporter_port, 9100);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
platforms:
  order: [olvm, vsphere]
  olvm:
    url: https://engine.lab/ovirt-engine/api
    timing:
      poll_interval_secs: 5
cache:
  list_ttl_secs: 30
"#;
        let settings = parse_settings(Path::new("chaosmonkey.yaml"), yaml).unwrap();
        assert_eq!(settings.platforms.order, vec![PlatformKind::Olvm, PlatformKind::Vsphere]);
        assert_eq!(settings.platforms.olvm.timing.poll_interval_secs, 5);
        assert_eq!(settings.platforms.olvm.timing.forced_timeout_secs, 180);
        assert_eq!(settings.cache.list_ttl_secs, 30);
        assert_eq!(settings.cache.record_ttl_secs, 300);
    }

    #[test]
    fn test_env_fills_only_missing_credentials() {
        let vars: HashMap<&str, &str> = [
            ("VSPHERE_SERVER", "vc.lab"),
            ("VSPHERE_USERNAME", "env-user"),
            ("VSPHERE_INSECURE", "false"),
            ("OLVM_PASSWORD", "secret"),
            ("NOMAD_TOKEN", "tok"),
            ("PROMETHEUS_TIMEOUT", "3"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.platforms.vsphere.username = Some("file-user".into());
        settings.apply_env_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(settings.platforms.vsphere.server.as_deref(), Some("vc.lab"));
        assert_eq!(settings.platforms.vsphere.username.as_deref(), Some("file-user"));
        assert!(!settings.platforms.vsphere.insecure);
        assert_eq!(settings.platforms.olvm.password.as_deref(), Some("secret"));
        assert_eq!(settings.platforms.nomad.token.as_deref(), Some("tok"));
        assert_eq!(settings.prometheus.timeout_secs, 3);
    }

    #[tokio::test]
    async fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"experiment": {{"action_timeout_secs": 120}}}}"#).unwrap();

        let settings = load_settings(Some(file.path())).await.unwrap();
        assert_eq!(settings.experiment.action_timeout_secs, 120);
        assert_eq!(settings.experiment.sample_timeout_secs, 10);
    }

    #[tokio::test]
    async fn test_invalid_file_is_an_error() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(file, "platforms: [this, is, not, a, map]").unwrap();
        assert!(load_settings(Some(file.path())).await.is_err());
    }
}
