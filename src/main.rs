// llmsnap - model-swapping proxy for local inference servers
//
// Startup wiring: parse the CLI, load and validate the YAML config (a bad
// config is a non-zero exit before anything binds), initialize tracing
// with the in-memory capture layer, build the process groups, and serve
// until ctrl-c. Shutdown stops every child before the server exits.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use llmsnap::cli::{self, Cli};
use llmsnap::config::Config;
use llmsnap::events::EventBus;
use llmsnap::logging::{CaptureLayer, LogBuffer};
use llmsnap::proxy::{start_proxy, ProxyState};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Subcommands (config --show/--check/--path) run and exit early
    if cli::handle_command(&args)? {
        return Ok(());
    }

    let mut config = Config::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
        config.validate()?;
    }

    let bus = EventBus::new();
    let log_buffer = LogBuffer::new();

    // Precedence: RUST_LOG env var > config file > default "info"
    let default_filter = format!("llmsnap={},tower_http=debug,axum=debug", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(CaptureLayer::new(log_buffer.clone(), bus.clone()))
        .init();

    tracing::info!(
        "llmsnap {} managing {} model(s) in {} group(s)",
        llmsnap::config::VERSION,
        config.models.len(),
        config.groups.len()
    );

    let state = ProxyState::new(config, bus, log_buffer);

    // Oneshot channel for graceful server shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let mut server = tokio::spawn(start_proxy(state.clone(), shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
            state.shutdown().await;
            let _ = shutdown_tx.send(());
            let _ = server.await;
        }
        result = &mut server => {
            // The server ended on its own (bind failure or fatal error)
            state.shutdown().await;
            result.context("proxy server task failed")??;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
