//! Launcher for the image-generation backend (C7).

use anyhow::Context as _;
use clap::Parser;
use dreambotrs::address::WorkerEnd;
use dreambotrs::backend::image::{self, ImageBackend};
use dreambotrs::bus::BusManager;
use dreambotrs::config::Config;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dreambotrs-image", version)]
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
    let Some(image_config) = &config.image else {
        tracing::error!("no [image] section configured");
        std::process::exit(1);
    };

    let mut manager = BusManager::connect(&config.nats_uri.as_vec()).await?;
    let backend = Arc::new(ImageBackend::new(image_config.clone()));
    manager.register(WorkerEnd::Backend, "image", None, backend.clone());
    manager.run().await?;

    // The push-channel socket runs independently of boot/readiness: a
    // disconnected image service degrades to `receive()` returning a
    // redeliverable error rather than blocking the bus pump.
    image::spawn_push_channel(backend);

    dreambotrs::runtime::wait_for_shutdown_signal().await;
    manager.shutdown().await?;
    Ok(())
}
