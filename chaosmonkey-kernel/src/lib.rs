//! Chaos experiment kernel
//!
//! Drives power-state faults against hypervisor and scheduler targets while
//! sampling metrics before, during and after the fault:
//! - `platforms` + `registry`: vSphere / OLVM / Nomad adapters behind one fallback chain
//! - `inventory` + `cache`: cached target discovery with incremental refresh
//! - `resolver`: requested identifiers -> inventory targets
//! - `metrics`: Prometheus and Nomad sampling, recovery analysis
//! - `sequencer`: the per-target experiment state machine

pub mod cache;
pub mod config;
pub mod errors;
pub mod inventory;
pub mod metrics;
pub mod models;
pub mod platforms;
pub mod registry;
pub mod resolver;
pub mod sequencer;
pub mod state;

pub use cache::{CacheLayer, CacheStore, MemoryStore};
pub use config::{load_settings, Settings};
pub use inventory::{InventoryClient, InventorySnapshot};
pub use metrics::{MetricSource, MetricsSampler};
pub use platforms::{DiscoveryFilter, PlatformAdapter};
pub use registry::PlatformRegistry;
pub use resolver::{resolve, Resolution};
pub use sequencer::Sequencer;
