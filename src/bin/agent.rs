//! Preview edge agent.
//!
//! Runs inside a preview environment: discovers compose services from the
//! container runtime and keeps the gateway's tunnel registrations in sync
//! over one outbound SSH connection.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use preview_gateway::agent;
use preview_gateway::config::{AgentConfig, AgentOverrides};

/// Preview edge agent - tunnels environment services to the gateway
#[derive(Parser, Debug)]
#[command(name = "preview-agent", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/preview-agent/agent.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Environment id
    #[arg(long)]
    env_id: Option<String>,

    /// Gateway SSH URL (ssh:// or ssh+tls://)
    #[arg(long)]
    ssh_url: Option<String>,

    /// Container runtime socket path
    #[arg(long)]
    docker_socket: Option<String>,

    /// Agent API listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Discovery debounce window in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Skip TLS certificate verification (self-signed gateways)
    #[arg(long)]
    insecure_skip_verify: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = AgentConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    let args = AgentOverrides {
        env_id: cli.env_id,
        ssh_url: cli.ssh_url,
        docker_socket: cli.docker_socket,
        listen_addr: cli.listen,
        debounce_ms: cli.debounce_ms,
        insecure_skip_verify: cli.insecure_skip_verify.then_some(true),
        ..Default::default()
    };

    let config = AgentConfig::resolve(Some(&cli.config), args)
        .with_context(|| format!("Failed to resolve config (file {})", cli.config.display()))?;

    info!("Starting preview-agent");
    info!("  Environment: {}", config.env_id);
    info!("  Gateway: {}", config.ssh_url);
    info!("  API: {}", config.listen_addr);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    agent::run(Arc::new(config), cancel).await
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
