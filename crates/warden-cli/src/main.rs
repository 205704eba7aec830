//! Main entry point for the warden lock client.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod cli;
mod commands;
mod logging;
mod shutdown;

use cli::Cli;
use logging::LoggingConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _logging_guard = logging::init_logging(&LoggingConfig::from_env())?;
    warden_lock::metrics::init_metrics();

    let configuration = cli::load_configuration(&cli)?;
    let settings = configuration.lock_settings()?;
    info!(
        backend = %settings.backend,
        ttl = settings.ttl_secs,
        wait_timeout = settings.wait_timeout_secs,
        "Lock settings loaded"
    );

    let shutdown = CancellationToken::new();
    shutdown::cancel_on_signal(shutdown.clone());

    let coordinator = warden_lock::connect(&settings, shutdown.clone()).await?;
    let result = commands::run(&cli.command, coordinator.clone(), &settings, &shutdown).await;

    coordinator.shutdown().await;
    shutdown.cancel();
    result
}
