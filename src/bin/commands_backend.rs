//! Launcher for the utility-commands backend (C9).

use anyhow::Context as _;
use clap::Parser;
use dreambotrs::address::WorkerEnd;
use dreambotrs::backend::CommandsBackend;
use dreambotrs::bus::BusManager;
use dreambotrs::config::Config;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dreambotrs-commands", version)]
struct Cli {
    /// Path to the JSON config file.
    config: std::path::PathBuf,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Only log warnings and errors.
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter_handle = dreambotrs::runtime::init_tracing(cli.debug, cli.quiet);
    dreambotrs::runtime::spawn_loglevel_toggle(filter_handle);

    let config = Config::load_from_path(&cli.config).context("failed to load config")?;

    let mut manager = BusManager::connect(&config.nats_uri.as_vec()).await?;
    let backend = Arc::new(CommandsBackend::new());
    manager.register(WorkerEnd::Backend, "commands", None, backend);
    manager.run().await?;

    dreambotrs::runtime::wait_for_shutdown_signal().await;
    manager.shutdown().await?;
    Ok(())
}
