//! Launcher for the Slack frontend (C6).

use anyhow::Context as _;
use clap::Parser;
use dreambotrs::address::WorkerEnd;
use dreambotrs::bus::BusManager;
use dreambotrs::config::Config;
use dreambotrs::frontend::SlackFrontend;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dreambotrs-slack", version)]
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
    let Some(slack) = &config.slack else {
        tracing::error!("no [slack] section configured");
        std::process::exit(1);
    };

    let mut manager = BusManager::connect(&config.nats_uri.as_vec()).await?;
    let frontend = Arc::new(SlackFrontend::new(slack.bot_token.clone(), slack.app_token.clone(), config.triggers.clone()));
    manager.register(WorkerEnd::Frontend, "slack", None, frontend);
    manager.run().await?;

    dreambotrs::runtime::wait_for_shutdown_signal().await;
    manager.shutdown().await?;
    Ok(())
}
