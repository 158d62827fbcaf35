//! Launcher for the IRC frontend (C5): one worker per configured server.

use anyhow::Context as _;
use clap::Parser;
use dreambotrs::address::WorkerEnd;
use dreambotrs::bus::BusManager;
use dreambotrs::config::Config;
use dreambotrs::frontend::IrcFrontend;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dreambotrs-irc", version)]
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
    if config.irc.is_empty() {
        tracing::error!("no [irc] servers configured");
        std::process::exit(1);
    }

    let mut manager = BusManager::connect(&config.nats_uri.as_vec()).await?;
    for server in &config.irc {
        let frontend = Arc::new(IrcFrontend::new(
            server.clone(),
            config.triggers.clone(),
            config.output_dir.clone(),
            config.uri_base.clone(),
        ));
        manager.register(WorkerEnd::Frontend, "irc", Some(server.host.clone()), frontend);
    }
    manager.run().await?;

    dreambotrs::runtime::wait_for_shutdown_signal().await;
    manager.shutdown().await?;
    Ok(())
}
