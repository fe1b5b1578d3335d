#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # testkube-agent
//!
//! Cluster agent that keeps an outbound tunnel to the Testkube control plane.
//!
//! The agent dials out (it never listens) and holds four streams open:
//! command execution against the local handler, event forwarding, and the
//! log and notification relays. Any stream failure tears the session down
//! and the agent reconnects after a fixed pause.
//!
//! ## Subcommands
//!
//! - `testkube-agent run` (default): connect and serve until SIGINT/SIGTERM
//! - `testkube-agent check-config`: load, validate and print the effective config
//!
//! ## Configuration
//!
//! TOML file (`--config <path>`, or `testkube-agent.toml` in the working
//! directory) with `TESTKUBE_*` environment overrides. See [`config`].

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use testkube_agent::{
    config, event_queue, routes, Agent, AgentStatus, AppState, Config, ExecutionHub,
};

/// Testkube cluster agent.
#[derive(Parser)]
#[command(name = "testkube-agent", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the control plane (default when no subcommand given).
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Validate the configuration and print the effective values.
    CheckConfig {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::CheckConfig { config }) => check_config(config.as_deref()),
        Some(Commands::Run { config }) => run(config.as_deref()).await,
        None => run(None).await,
    }
}

fn check_config(config_path: Option<&str>) -> ExitCode {
    match Config::load(config_path) {
        Ok(config) => {
            let cp = &config.control_plane;
            println!("control plane: {}", cp.url);
            println!("api key set:   {}", !cp.api_key.is_empty());
            println!("cluster id:    {}", cp.cluster_id);
            println!("runner id:     {}", cp.runner_id);
            println!("tls:           {}", if cp.insecure { "off" } else { "on" });
            println!("{:#?}", config.tunnel);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config_path: Option<&str>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("testkube-agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Control plane: {}", config.control_plane.url);
    if config.control_plane.api_key.is_empty() {
        warn!("No agent API key configured, set TESTKUBE_PRO_API_KEY or update {}", config::DEFAULT_CONFIG_FILE);
    }

    let config = Arc::new(config);
    let (events, event_rx) = event_queue(config.tunnel.event_queue_capacity);
    let hub = Arc::new(ExecutionHub::default());
    let status = Arc::new(AgentStatus::new());
    let state = AppState::new(config.clone(), hub.clone(), events, status.clone());

    let agent = Agent::new(
        &config,
        routes::router(state),
        event_rx,
        hub.clone(),
        hub,
    )
    .with_status(status);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match agent.run(cancel).await {
        Err(e) if !e.is_cancelled() => {
            error!(error = %e, "agent stopped unexpectedly");
            ExitCode::FAILURE
        }
        _ => {
            info!("Shutting down...");
            ExitCode::SUCCESS
        }
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
    cancel.cancel();
}
