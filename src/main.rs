//! Cluster-controller daemon entry point.
//!
//! Loads settings, starts the runtime, and runs until interrupted. All core
//! behavior lives in the `joynr_cc` library.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use joynr_cc::runtime::ClusterControllerRuntime;
use joynr_cc::settings::Settings;

/// Cluster-controller messaging daemon.
#[derive(Debug, Parser)]
#[command(name = "joynr-cc", version, about)]
struct Args {
    /// Path to the JSON settings file; defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override `uds/socket-path` from the settings file.
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Override `messaging/ttl-uplift-ms` from the settings file.
    #[arg(long)]
    ttl_uplift_ms: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => Settings::load(path).context("load settings")?,
        None => Settings::default(),
    };
    if let Some(socket_path) = args.socket_path {
        settings.uds.socket_path = socket_path;
    }
    if let Some(ttl_uplift_ms) = args.ttl_uplift_ms {
        settings.messaging.ttl_uplift_ms = ttl_uplift_ms;
    }

    let runtime = ClusterControllerRuntime::start(&settings).context("start runtime")?;
    log::info!(
        "joynr-cc running on {}",
        settings.uds.socket_path.display()
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    log::info!("shutting down");
    runtime.shutdown().await;
    Ok(())
}
