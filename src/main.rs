use anyhow::Context;
use std::path::PathBuf;
use tracing::info;

use pharmacy_offline::config::OfflineConfig;
use pharmacy_offline::{logging, OfflineRuntime};

const CONFIG_ENV: &str = "PHARMACY_OFFLINE_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

    let config = OfflineConfig::load(config_path.as_deref()).context("loading configuration")?;
    let _log_guard = logging::init(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BUILD_GIT_SHA"),
        built = env!("BUILD_TIMESTAMP"),
        "Starting pharmacy offline service"
    );

    let runtime = OfflineRuntime::start(config)
        .await
        .context("starting offline runtime")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");
    runtime.shutdown().await;

    Ok(())
}
