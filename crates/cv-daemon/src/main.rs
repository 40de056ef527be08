//! conveyor daemon: runs the worker pool and the orchestration loop until
//! ctrl-c.
//!
//! Usage: `cv-daemon [CONFIG_PATH]`. Without a path the config is read from
//! `~/.conveyor/config.toml`, falling back to defaults.

use anyhow::{Context, Result};
use cv_core::config::Config;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(&path).with_context(|| format!("failed to load {path}"))?,
        None => Config::load().context("failed to load config")?,
    };

    let format = config.general.log_format()?;
    cv_telemetry::logging::init("cv-daemon", &config.general.log_level, format);

    info!(
        project = %config.general.project_name,
        store = %config.store.resolved_path().display(),
        version = env!("CARGO_PKG_VERSION"),
        "conveyor daemon starting"
    );

    let daemon = cv_daemon::daemon::Daemon::new(config).await?;
    daemon
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("ctrl-c received, initiating shutdown");
        })
        .await
}
