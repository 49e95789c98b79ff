//! Carewise analysis orchestrator server.
//!
//! Loads configuration, wires the orchestrator to its collaborators, starts
//! the worker pool and serves the HTTP API until interrupted. In-flight jobs
//! are cancelled on shutdown.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use carewise_config::{ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use carewise_server::{create_app, infra::startup::build_app_state};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "carewise-server")]
#[command(about = "Patient analysis orchestrator: admission queue, module fan-out and synthesis")]
struct Cli {
    /// Path to a carewise.toml (or .json) configuration file
    #[arg(short, long, env = "CAREWISE_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Alternate .env file to load before reading the environment
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "CAREWISE_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "CAREWISE_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let ConfigLoad {
        mut config,
        warnings,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.config,
        env_file: cli.env_file,
    })
    .load()
    .context("failed to load configuration")?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Audit records stay visible at the default level. Override via RUST_LOG.
                "info,analysis::audit=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = config.metadata.config_path.as_ref() {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    let addr = config.server.bind_address();
    let state = build_app_state(config)?;
    let orchestrator = state.orchestrator.clone();

    orchestrator
        .start()
        .await
        .context("failed to start analysis workers")?;

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %addr, "carewise server listening");

    let serve_result = axum::serve(listener, create_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("stopping analysis workers");
    orchestrator
        .shutdown()
        .await
        .context("failed to stop analysis workers")?;

    serve_result.context("HTTP server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
