//! flowgated - flowgate control plane daemon
//!
//! Serves the orchestrator over HTTP:
//! - build, lock and arm flows against a resource
//! - terminate, retry and clone flows
//! - force-release stale locks and inspect task progress

mod error;
mod routes;
mod state;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use flowgate_config::FlowgateConfig;
use flowgate_controlplane::{SnapshotFile, Tables};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "flowgated")]
#[command(about = "flowgate control plane daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Configuration file (otherwise discovered)
        #[arg(short, long, env = "FLOWGATE_CONFIG")]
        config: Option<PathBuf>,
        /// Listen address, overrides the configuration
        #[arg(short, long)]
        listen: Option<SocketAddr>,
        /// Debug logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// Validate the configuration and print the effective values
    #[command(name = "check-config")]
    CheckConfig {
        #[arg(short, long, env = "FLOWGATE_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print the version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("flowgated {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::CheckConfig { config } => {
            init_logging(false);
            check_config(config)
        }
        Commands::Serve {
            config,
            listen,
            verbose,
        } => {
            init_logging(verbose);
            serve(config, listen).await
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(explicit: Option<PathBuf>) -> Result<(Option<PathBuf>, FlowgateConfig)> {
    flowgate_config::load_or_default(explicit.as_deref()).context("failed to load configuration")
}

fn check_config(explicit: Option<PathBuf>) -> Result<()> {
    let (path, config) = load_config(explicit)?;

    match &path {
        Some(path) => println!("{} {}", "✓".green(), path.display()),
        None => println!("{} no configuration file, using defaults", "✓".green()),
    }
    println!("  {:<20} {}", "listen".bold(), config.listen);
    println!("  {:<20} {} days", "lookback".bold(), config.lookback_days);
    println!(
        "  {:<20} {}",
        "state-file".bold(),
        config
            .state_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".dimmed().to_string())
    );
    println!(
        "  {:<20} poll {}ms, max wait {}s",
        "watcher".bold(),
        config.watcher.poll_interval_ms,
        config.watcher.max_wait_secs
    );
    println!(
        "  {:<20} flow timeout {}s, failure grace {}s",
        "engine".bold(),
        config.engine.flow_timeout_secs,
        config.engine.failure_grace_secs
    );
    println!(
        "  {:<20} enabled {}, max {} retries, backoff {}-{}ms",
        "retry".bold(),
        config.retry.enabled,
        config.retry.max_retries,
        config.retry.min_backoff_ms,
        config.retry.max_backoff_ms
    );
    println!("  {:<20} {}", "chunk-size".bold(), config.default_chunk_size);
    for (kind, size) in &config.chunk_sizes {
        println!("    {kind} {size}");
    }
    Ok(())
}

async fn serve(explicit: Option<PathBuf>, listen: Option<SocketAddr>) -> Result<()> {
    let (path, config) = load_config(explicit)?;
    if let Some(path) = &path {
        tracing::info!(path = %path.display(), "configuration loaded");
    }

    let snapshot = config.state_file.as_ref().map(SnapshotFile::new);
    let tables = match &snapshot {
        Some(file) => file
            .load()
            .await
            .with_context(|| format!("failed to restore {}", file.path().display()))?,
        None => Tables::default(),
    };
    if !tables.locks.is_empty() {
        tracing::warn!(
            locks = tables.locks.len(),
            "restored locks belong to flows of a previous run; release them with force-unlock"
        );
    }

    let state = AppState::build(&config, tables);
    let app = routes::build_router(state.clone());

    let addr = listen.unwrap_or(config.listen);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "flowgated listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(file) = &snapshot {
        let tables = state.store.snapshot().await;
        file.save(&tables)
            .await
            .with_context(|| format!("failed to save {}", file.path().display()))?;
        tracing::info!(path = %file.path().display(), "store snapshot saved");
    }
    tracing::info!("flowgated stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
