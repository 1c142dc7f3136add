//! Error taxonomy
//!
//! - `ConnectError`: backend unreachable or rejected credentials (per adapter attempt)
//! - `PowerError`: target missing, invalid transition, escalation exhausted (per target)
//! - `AggregateError`: every adapter in the fallback chain failed (per target)
//! - `SamplingError`: metric source unreachable (degrades to a null snapshot)
//! - `ResolutionError`: no requested target exists (aborts the batch)
//! - `CacheError`: cache backend failure (never escapes the cache layer)
//!
//! All errors are `Clone` so they can be copied into outcomes; transport errors
//! are flattened into strings at the adapter boundary.

use crate::models::{ActionFailure, AttemptFailure};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("not configured")]
    NotConfigured,
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConnectError {
    /// Classify a transport error raised while talking to a backend
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            ConnectError::Unreachable(err.to_string())
        } else if err.status().map(|s| s.as_u16() == 401 || s.as_u16() == 403).unwrap_or(false) {
            ConnectError::Auth(err.to_string())
        } else {
            ConnectError::Protocol(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PowerError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("target not found: {0}")]
    NotFound(String),
    #[error("invalid transition for {target}: {reason}")]
    InvalidTransition { target: String, reason: String },
    #[error("{target} did not reach the {desired} state within {waited:?}")]
    Timeout { target: String, desired: String, waited: Duration },
    #[error("forced fallback failed for {target}: {reason}")]
    ForcedFallbackFailed { target: String, reason: String },
    #[error("request failed: {0}")]
    Request(String),
}

/// One adapter's failure inside a registry call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterFailure {
    pub platform: String,
    pub error: PowerError,
}

/// Every adapter of the fallback chain failed for one target
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", render_failures(.failures))]
pub struct AggregateError {
    pub target: String,
    pub failures: Vec<AdapterFailure>,
}

fn render_failures(failures: &[AdapterFailure]) -> String {
    if failures.is_empty() {
        return "no platform adapter available".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{}: {}", f.platform, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl AggregateError {
    /// Serialisable form attached to the per-target outcome
    pub fn to_failure(&self) -> ActionFailure {
        ActionFailure {
            message: self.to_string(),
            attempts: self
                .failures
                .iter()
                .map(|f| AttemptFailure { platform: f.platform.clone(), error: f.error.to_string() })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SamplingError {
    #[error("metric source unreachable: {0}")]
    Unreachable(String),
    #[error("no series for {0}")]
    NoData(String),
    #[error("metric query timed out after {0:?}")]
    Timeout(Duration),
    #[error("unsupported target: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("no targets requested")]
    NothingRequested,
    #[error("none of the requested targets exist: {}", join_ids(.requested))]
    NoneMatched { requested: Vec<String> },
}

fn join_ids(ids: &[String]) -> String {
    ids.join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_display_lists_every_adapter() {
        let err = AggregateError {
            target: "vm1".into(),
            failures: vec![
                AdapterFailure {
                    platform: "vsphere".into(),
                    error: PowerError::Connect(ConnectError::Unreachable("connection refused".into())),
                },
                AdapterFailure { platform: "olvm".into(), error: ConnectError::NotConfigured.into() },
            ],
        };
        assert_eq!(err.to_string(), "vsphere: unreachable: connection refused; olvm: not configured");

        let failure = err.to_failure();
        assert_eq!(failure.attempts.len(), 2);
        assert_eq!(failure.attempts[1].platform, "olvm");
        assert_eq!(failure.attempts[1].error, "not configured");
    }

    #[test]
    fn test_none_matched_message() {
        let err = ResolutionError::NoneMatched { requested: vec!["vm8".into(), "vm9".into()] };
        assert_eq!(err.to_string(), "none of the requested targets exist: vm8, vm9");
    }
}
