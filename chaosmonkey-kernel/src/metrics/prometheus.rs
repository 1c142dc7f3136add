//! Node-exporter metrics through the Prometheus HTTP API
//!
//! Hostnames are reduced to their short form before lookup
//! (`web-01.lab.example.com` -> `web-01`), then the instance label is found
//! by probing `up{instance="<host>:<port>"}` for the short name and each
//! configured domain suffix. Resolved instances are remembered.

use super::MetricSource;
use crate::config::PrometheusSettings;
use crate::errors::SamplingError;
use crate::models::{MetricReading, Target};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    /// `[timestamp, "value"]`
    value: (f64, String),
}

/// First value of an instant-vector response, `None` for an empty vector
fn first_value(body: QueryResponse) -> Result<Option<f64>, SamplingError> {
    if body.status != "success" {
        return Err(SamplingError::Unreachable(body.error.unwrap_or_else(|| "query failed".into())));
    }
    let Some(sample) = body.data.and_then(|d| d.result.into_iter().next()) else {
        return Ok(None);
    };
    sample
        .value
        .1
        .parse::<f64>()
        .map(Some)
        .map_err(|e| SamplingError::Unreachable(format!("bad sample value: {e}")))
}

pub fn short_hostname(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

fn cpu_query(instance: &str) -> String {
    format!(r#"100 - (avg by (instance) (rate(node_cpu_seconds_total{{mode="idle",instance="{instance}"}}[5m])) * 100)"#)
}

fn memory_query(instance: &str) -> String {
    format!(
        r#"(1 - (node_memory_MemAvailable_bytes{{instance="{instance}"}} / node_memory_MemTotal_bytes{{instance="{instance}"}})) * 100"#
    )
}

fn disk_query(metric: &str, instance: &str) -> String {
    format!(r#"sum(rate({metric}{{instance="{instance}"}}[5m]))"#)
}

pub struct PrometheusSource {
    client: reqwest::Client,
    url: String,
    exporter_port: u16,
    domain_suffixes: Vec<String>,
    instances: Mutex<HashMap<String, String>>,
}

impl PrometheusSource {
    /// `None` when no Prometheus URL is configured
    pub fn from_settings(settings: &PrometheusSettings) -> Option<Self> {
        let url = settings.url.as_ref()?.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .ok()?;
        Some(Self {
            client,
            url,
            exporter_port: settings.exporter_port,
            domain_suffixes: settings.domain_suffixes.clone(),
            instances: Mutex::new(HashMap::new()),
        })
    }

    /// Instance labels to try, most likely first
    pub fn instance_candidates(&self, hostname: &str) -> Vec<String> {
        let short = short_hostname(hostname);
        let mut hosts = vec![short.to_string()];
        if hostname != short {
            hosts.push(hostname.to_string());
        }
        for suffix in &self.domain_suffixes {
            let fqdn = format!("{}.{}", short, suffix.trim_start_matches('.'));
            if !hosts.contains(&fqdn) {
                hosts.push(fqdn);
            }
        }
        hosts.into_iter().map(|h| format!("{}:{}", h, self.exporter_port)).collect()
    }

    async fn query(&self, promql: &str) -> Result<Option<f64>, SamplingError> {
        let resp = self
            .client
            .get(format!("{}/api/v1/query", self.url))
            .query(&[("query", promql)])
            .send()
            .await
            .map_err(|e| SamplingError::Unreachable(e.to_string()))?;
        let body: QueryResponse = resp.json().await.map_err(|e| SamplingError::Unreachable(e.to_string()))?;
        first_value(body)
    }

    async fn resolve_instance(&self, hostname: &str) -> Result<String, SamplingError> {
        let short = short_hostname(hostname).to_string();
        let known = self.instances.lock().get(&short).cloned();
        if let Some(instance) = known {
            return Ok(instance);
        }
        for candidate in self.instance_candidates(hostname) {
            if self.query(&format!(r#"up{{instance="{candidate}"}}"#)).await?.is_some() {
                debug!("prometheus: {} resolved to instance {}", hostname, candidate);
                self.instances.lock().insert(short, candidate.clone());
                return Ok(candidate);
            }
        }
        Err(SamplingError::NoData(format!("{hostname} (no node exporter instance)")))
    }
}

#[async_trait]
impl MetricSource for PrometheusSource {
    fn name(&self) -> &str {
        "prometheus"
    }

    async fn sample(&self, target: &Target) -> Result<MetricReading, SamplingError> {
        let instance = self.resolve_instance(&target.display_name).await?;
        let cpu = self.query(&cpu_query(&instance)).await?;
        let memory = self.query(&memory_query(&instance)).await?;
        let read = self.query(&disk_query("node_disk_read_bytes_total", &instance)).await?;
        let written = self.query(&disk_query("node_disk_written_bytes_total", &instance)).await?;

        if cpu.is_none() && memory.is_none() && read.is_none() && written.is_none() {
            return Err(SamplingError::NoData(instance));
        }
        Ok(MetricReading {
            cpu_percent: cpu,
            memory_percent: memory,
            disk_read_bytes: read.map(|v| v.max(0.0).round() as u64),
            disk_write_bytes: written.map(|v| v.max(0.0).round() as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(suffixes: &[&str]) -> PrometheusSource {
        PrometheusSource::from_settings(&PrometheusSettings {
            url: Some("http://prometheus:9090/".into()),
            domain_suffixes: suffixes.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_short_hostname() {
        assert_eq!(short_hostname("web-01.lab.example.com"), "web-01");
        assert_eq!(short_hostname("web-01"), "web-01");
    }

    #[test]
    fn test_instance_candidates() {
        let prom = source(&["lab.example.com", ".corp"]);
        assert_eq!(
            prom.instance_candidates("web-01.lab.example.com"),
            vec!["web-01:9100", "web-01.lab.example.com:9100", "web-01.corp:9100"]
        );
        assert_eq!(prom.url, "http://prometheus:9090");
    }

    #[test]
    fn test_unconfigured_is_none() {
        assert!(PrometheusSource::from_settings(&PrometheusSettings::default()).is_none());
    }

    #[test]
    fn test_vector_parsing() {
        let body: QueryResponse = serde_json::from_str(
            r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{"instance":"web-01:9100"},"value":[1700000000.1,"42.5"]}]}}"#,
        )
        .unwrap();
        assert_eq!(first_value(body).unwrap(), Some(42.5));

        let empty: QueryResponse =
            serde_json::from_str(r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#).unwrap();
        assert_eq!(first_value(empty).unwrap(), None);

        let failed: QueryResponse = serde_json::from_str(r#"{"status":"error","error":"parse error"}"#).unwrap();
        assert!(first_value(failed).is_err());
    }

    #[test]
    fn test_cpu_query_shape() {
        assert_eq!(
            cpu_query("web-01:9100"),
            r#"100 - (avg by (instance) (rate(node_cpu_seconds_total{mode="idle",instance="web-01:9100"}[5m])) * 100)"#
        );
    }
}
