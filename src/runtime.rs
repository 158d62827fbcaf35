//! Shared launcher runtime: tracing init and signal-driven shutdown (§6
//! "CLI surface, concretely"), the common pieces six otherwise-independent
//! `src/bin/*.rs` launchers would each duplicate.

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{reload, EnvFilter};

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

fn build_env_filter(debug: bool, quiet: bool) -> EnvFilter {
    if quiet {
        EnvFilter::new("warn")
    } else if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    }
}

/// Install the global tracing subscriber and return a handle that lets a
/// `SIGHUP` handler flip the filter between `DEBUG` and `INFO` at runtime.
pub fn init_tracing(debug: bool, quiet: bool) -> FilterHandle {
    let filter = build_env_filter(debug, quiet);
    let (filter, handle) = reload::Layer::new(filter);
    let fmt_layer = tracing_subscriber::fmt::layer().compact();
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    handle
}

/// Spawn the `SIGHUP` handler that toggles the installed filter between
/// `DEBUG` and `INFO` (§2 "AMBIENT Logging").
pub fn spawn_loglevel_toggle(handle: FilterHandle) {
    tokio::spawn(async move {
        let mut debug_level = false;
        let Ok(mut sighup) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) else {
            tracing::warn!("failed to install SIGHUP handler");
            return;
        };
        loop {
            sighup.recv().await;
            debug_level = !debug_level;
            let new_filter = if debug_level { EnvFilter::new("debug") } else { EnvFilter::new("info") };
            if handle.reload(new_filter).is_err() {
                tracing::warn!("failed to reload tracing filter");
                continue;
            }
            tracing::info!(debug = debug_level, "log level toggled via SIGHUP");
        }
    });
}

/// Wait for `SIGINT` or `SIGTERM`, whichever arrives first (§4.3 step 8:
/// "shutdown signals cancel pump tasks and close the bus connection").
pub async fn wait_for_shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
