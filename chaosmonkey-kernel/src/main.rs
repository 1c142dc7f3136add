//! chaosmonkey - run one experiment descriptor and print the batch outcome
//!
//! Usage: `chaosmonkey <experiment.yaml> [settings.yaml]`
//!
//! Ctrl-C stops the batch between targets; the outcome of everything that
//! already ran is still printed as JSON on stdout.

use anyhow::{Context, Result};
use chaosmonkey_kernel::models::ExperimentDescriptor;
use chaosmonkey_kernel::{
    load_settings, CacheLayer, DiscoveryFilter, InventoryClient, MemoryStore, MetricsSampler, PlatformRegistry,
    Sequencer,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

async fn read_descriptor(path: &PathBuf) -> Result<ExperimentDescriptor> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read experiment {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("invalid experiment {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chaosmonkey_kernel=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let descriptor_path = PathBuf::from(args.next().context("usage: chaosmonkey <experiment.yaml> [settings.yaml]")?);
    let settings_path = args.next().map(PathBuf::from);

    let settings = load_settings(settings_path.as_deref()).await?;
    let descriptor = read_descriptor(&descriptor_path).await?;

    let cache = CacheLayer::new(Arc::new(MemoryStore::new()), &settings.cache);
    let registry = Arc::new(PlatformRegistry::from_settings(&settings));
    let inventory = InventoryClient::new(cache, DiscoveryFilter::default());
    let snapshot = inventory.snapshot(&registry, false).await;
    for (platform, err) in &snapshot.errors {
        warn!("{} inventory unavailable: {}", platform, err);
    }

    let sampler = Arc::new(MetricsSampler::from_settings(&settings));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sequencer = Sequencer::new(
        registry,
        sampler,
        Duration::from_secs(settings.experiment.action_timeout_secs),
    )
    .with_outcome_channel(tx);

    let token = sequencer.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current target");
            token.cancel();
        }
    });

    let progress = tokio::spawn(async move {
        while let Some(outcome) = rx.recv().await {
            info!("{} finished: {:?}", outcome.target.identifier, outcome.state);
        }
    });

    let batch = sequencer.run(&descriptor, &snapshot.targets()).await?;
    drop(sequencer);
    progress.await.ok();

    println!("{}", serde_json::to_string_pretty(&batch)?);
    Ok(())
}
