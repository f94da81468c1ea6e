//! Binary entry point for concierge-cache.
//!
//! Serves the knowledge, session and push endpoints, and offers a few
//! operator commands for inspecting the cache.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use clap::{Parser, Subcommand};
use concierge_cache::config::ConciergeConfig;
use concierge_cache::webhooks::{SIGNATURE_HEADER, TIMESTAMP_HEADER, compute_signature};
use concierge_cache::{AppContext, SnapshotStore, current_timestamp_ms, http, observability};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

/// Concierge cache - resilient CMS knowledge and session service.
#[derive(Parser)]
#[command(name = "concierge-cache")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "CONCIERGE_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server.
    Serve {
        /// Listen address (overrides configuration).
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Aggregate and print the knowledge text once.
    Knowledge,

    /// Print push headers for a payload.
    Sign {
        /// Shared push secret.
        #[arg(long, env = "CONCIERGE_PUSH_SECRET", hide_env_values = true)]
        secret: String,

        /// Raw request body.
        #[arg(long)]
        body: String,

        /// Timestamp in milliseconds (default: now).
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// Inspect stored snapshots.
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
}

/// Snapshot subcommands.
#[derive(Subcommand)]
enum SnapshotAction {
    /// Print a snapshot as pretty JSON.
    Show {
        /// Snapshot key, e.g. `knowledge` or `events`.
        key: String,
    },
}

/// Main entry point.
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ConciergeConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    let expose_metrics = matches!(cli.command, Commands::Serve { .. });
    let _observability =
        match observability::init(config.observability_config(cli.verbose, expose_metrics)) {
            Ok(handle) => handle,
            Err(e) => {
                eprintln!("Failed to initialize observability: {e}");
                return ExitCode::FAILURE;
            },
        };

    match run_command(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command.
async fn run_command(
    command: Commands,
    config: ConciergeConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Serve { bind } => cmd_serve(config, bind).await,
        Commands::Knowledge => cmd_knowledge(config).await,
        Commands::Sign {
            secret,
            body,
            timestamp,
        } => cmd_sign(&secret, &body, timestamp),
        Commands::Snapshot {
            action: SnapshotAction::Show { key },
        } => cmd_snapshot_show(&config, &key),
    }
}

/// Serve command.
async fn cmd_serve(
    mut config: ConciergeConfig,
    bind: Option<SocketAddr>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    let addr = config.server.bind;
    let context = AppContext::build(config)?;

    http::serve(context.clone(), addr, shutdown_signal()).await?;
    context.shutdown().await;
    Ok(())
}

/// Knowledge command.
async fn cmd_knowledge(config: ConciergeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let context = AppContext::build(config)?;
    let knowledge = context.knowledge().get_with_freshness().await;
    eprintln!("freshness: {}", knowledge.freshness.as_str());
    println!("{}", knowledge.text);
    context.shutdown().await;
    Ok(())
}

/// Sign command.
fn cmd_sign(
    secret: &str,
    body: &str,
    timestamp: Option<i64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let timestamp = timestamp.map_or_else(|| current_timestamp_ms().to_string(), |t| t.to_string());
    let signature = compute_signature(secret, &timestamp, body.as_bytes())?;
    println!("{TIMESTAMP_HEADER}: {timestamp}");
    println!("{SIGNATURE_HEADER}: {signature}");
    Ok(())
}

/// Snapshot show command.
fn cmd_snapshot_show(config: &ConciergeConfig, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = SnapshotStore::new(&config.snapshot_dir);
    let path = store.path_for(key)?;
    let Some(value) = store.load::<serde_json::Value>(key) else {
        return Err(format!("no snapshot at {}", path.display()).into());
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
