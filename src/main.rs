// =============================================================================
// Borealis Trader — entry point
// =============================================================================
//
// Loads the YAML config, wires up logging, runs the orchestrator and waits
// for a shutdown signal. A watchdog forces exit if graceful shutdown
// stalls past five seconds.
// =============================================================================

mod config;
mod connector;
mod error;
mod executor;
mod orchestrator;
mod paper;
mod persistence;
mod predictor;
mod types;

use std::path::PathBuf;
use std::time::Duration;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::orchestrator::Orchestrator;
use crate::persistence::session::SessionEndReason;

#[derive(Parser, Debug)]
#[command(name = "borealis", about = "Model-driven trading runtime")]
struct Cli {
    /// Path to the YAML runtime configuration.
    #[arg(long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Log level filter (DEBUG, INFO, WARNING, ERROR). RUST_LOG overrides.
    #[arg(long, default_value = "INFO")]
    log_level: String,

    /// Run the full pipeline but never send orders.
    #[arg(long)]
    dry_run: bool,
}

fn level_filter(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARNING" | "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenv::dotenv();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet.
            eprintln!("fatal: {e:#}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // CLI wins over the config file when both are present.
        if cli.log_level != "INFO" {
            EnvFilter::new(level_filter(&cli.log_level))
        } else {
            EnvFilter::new(level_filter(&config.logging.level))
        }
    });

    let file_layer = config.logging.log_file.as_ref().and_then(|path| {
        let path = std::path::Path::new(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        match std::fs::File::create(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false),
            ),
            Err(e) => {
                eprintln!("warning: could not open log file {}: {e}", path.display());
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    let orchestrator = Orchestrator::new(config, cli.config.clone(), cli.dry_run)?;

    if let Err(e) = orchestrator.start().await {
        error!(error = %e, "fatal bootstrap error");
        orchestrator.stop(SessionEndReason::Unknown).await;
        std::process::exit(1);
    }

    // Wait for SIGINT / SIGTERM.
    shutdown_signal().await;
    warn!("shutdown signal received");

    // Watchdog: force exit if graceful shutdown hangs.
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        warn!("shutdown watchdog fired — forcing exit");
        std::process::exit(1);
    });

    orchestrator.stop(SessionEndReason::Normal).await;
    info!("goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
