//! Preview tunnel gateway.
//!
//! One TLS port, two protocols: agents connect over SSH (routed by SNI)
//! to register reverse tunnels, clients connect over HTTPS and are
//! proxied through them.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use preview_gateway::auth::SessionManager;
use preview_gateway::config::GatewayConfig;
use preview_gateway::demux::Demultiplexer;
use preview_gateway::http::HttpApp;
use preview_gateway::ssh::{Registry, SshTunnelServer};
use tokio_util::sync::CancellationToken;

/// Preview tunnel gateway - exposes preview-environment services over tunnels
#[derive(Parser, Debug)]
#[command(name = "preview-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/preview-gateway/gateway.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

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
        let config = GatewayConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    // Load configuration
    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    config.ensure_dirs()?;

    info!("Starting preview-gateway");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Base hostname: {}", config.base_hostname);
    info!("  SSH hostnames: {}", config.ssh_hostnames.join(", "));

    let config = Arc::new(config);

    // Session secret: configured, or fresh per process (sessions then
    // expire with the process, which is fine for single-instance setups).
    let secret = match &config.auth.secret {
        Some(secret) => secret.clone().into_bytes(),
        None => {
            use ring::rand::{SecureRandom, SystemRandom};
            let mut buf = vec![0u8; 32];
            SystemRandom::new()
                .fill(&mut buf)
                .map_err(|_| anyhow::anyhow!("Failed to generate session secret"))?;
            buf
        }
    };
    let sessions = Arc::new(SessionManager::new(
        &secret,
        config.auth.saas_login_url.clone(),
        config.auth.session_ttl_secs,
    ));

    let registry = Arc::new(Registry::new());

    let ssh_server = Arc::new(
        SshTunnelServer::new(config.clone(), registry.clone())
            .await
            .context("Failed to initialize SSH tunnel server")?,
    );
    let http_app = Arc::new(HttpApp::new(config.clone(), registry, sessions));

    let demux = Demultiplexer::new(config, ssh_server, http_app);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    demux.run(cancel).await
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
