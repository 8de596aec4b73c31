use std::sync::Arc;

use miette::{Context, IntoDiagnostic, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use tessera::{Config, LoopbackLink};
use tessera_core::{ClusterConfig, InstanceId};
use tessera_daemon::ReplicationManager;
use tessera_fjall::FjallStore;

#[derive(Debug, clap::Args)]
pub struct Args {}

#[tokio::main]
pub async fn run(config: Config, _args: &Args) -> Result<()> {
    let path = config
        .storage
        .path
        .clone()
        .ok_or_else(|| miette::miette!("the daemon needs storage.path set"))?;

    std::fs::create_dir_all(&path)
        .into_diagnostic()
        .context("creating storage directory")?;

    let store = FjallStore::open(&path, config.storage.cache)
        .into_diagnostic()
        .context("opening store")?;

    let cluster_raw = std::fs::read(&config.cluster)
        .into_diagnostic()
        .context("reading cluster view")?;
    let cluster: ClusterConfig = serde_json::from_slice(&cluster_raw)
        .into_diagnostic()
        .context("parsing cluster view")?;

    let link = Arc::new(LoopbackLink::new());
    let manager = Arc::new(ReplicationManager::new(
        InstanceId(config.node.instance),
        store.clone(),
        link.clone(),
        &config.storage,
    ));

    let version = cluster.version;
    manager.reconfigure(cluster);
    store
        .set_applied_config_version(version)
        .into_diagnostic()
        .context("persisting configuration marker")?;

    let cancel = CancellationToken::new();
    let sweep = tokio::spawn(manager.clone().run_sweep(cancel.child_token()));

    info!(instance = config.node.instance, "daemon running");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = link.notified() => {
                for (from, to, msg) in link.drain() {
                    manager.deliver(from, to, msg);
                }
            }
        }
    }

    info!("shutting down");
    cancel.cancel();
    let _ = sweep.await;

    Ok(())
}
