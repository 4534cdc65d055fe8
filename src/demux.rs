//! Connection demultiplexer: two protocols off one listening port.
//!
//! Every accepted socket goes through the TLS server handshake; the SNI
//! name captured during the handshake decides, exactly once and before any
//! application bytes are read, whether the secured stream is handed to
//! the SSH tunnel server or to the HTTP application. Sockets without SNI,
//! or naming an unknown host, fall through to HTTP as the default virtual
//! host. An optional plain-TCP listener feeds SSH directly, bypassing the
//! SNI check.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::http::HttpApp;
use crate::ssh::SshTunnelServer;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a freshly accepted socket goes. Decided once per socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Ssh,
    Http,
}

/// Pure routing decision from the negotiated SNI name.
pub fn route_for_sni(config: &GatewayConfig, sni: Option<&str>) -> RouteDecision {
    match sni {
        Some(name) if config.is_ssh_hostname(name) => RouteDecision::Ssh,
        _ => RouteDecision::Http,
    }
}

/// Build the rustls server config from configured PEM material, or
/// generate a self-signed certificate covering the gateway's hostnames.
pub fn load_tls_config(config: &GatewayConfig) -> Result<rustls::ServerConfig> {
    let (cert_pem, key_pem) = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert = std::fs::read(cert_path)
                .with_context(|| format!("Failed to read TLS cert {}", cert_path.display()))?;
            let key = std::fs::read(key_path)
                .with_context(|| format!("Failed to read TLS key {}", key_path.display()))?;
            (cert, key)
        }
        (None, None) => {
            info!("No TLS certificate configured; generating a self-signed one");
            let mut names = vec![
                config.base_hostname.clone(),
                format!("*.{}", config.base_hostname),
            ];
            names.extend(config.ssh_hostnames.iter().cloned());

            let mut params = rcgen::CertificateParams::new(names)
                .context("Failed to build certificate params")?;
            params.distinguished_name = rcgen::DistinguishedName::new();
            params
                .distinguished_name
                .push(rcgen::DnType::CommonName, config.base_hostname.as_str());

            let key_pair = rcgen::KeyPair::generate().context("Failed to generate TLS key")?;
            let cert = params
                .self_signed(&key_pair)
                .context("Failed to self-sign certificate")?;

            (
                cert.pem().into_bytes(),
                key_pair.serialize_pem().into_bytes(),
            )
        }
        _ => {
            return Err(anyhow!(
                "tls_cert_path and tls_key_path must be set together"
            ));
        }
    };

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?
        .ok_or_else(|| anyhow!("No private key found in TLS key PEM"))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid TLS certificate/key")?;

    Ok(tls_config)
}

/// The gateway's front door.
pub struct Demultiplexer {
    config: Arc<GatewayConfig>,
    ssh: Arc<SshTunnelServer>,
    http: Arc<HttpApp>,
}

impl Demultiplexer {
    pub fn new(config: Arc<GatewayConfig>, ssh: Arc<SshTunnelServer>, http: Arc<HttpApp>) -> Self {
        Self { config, ssh, http }
    }

    /// Accept and route connections until `cancel` fires, then stop
    /// accepting and abort the in-flight connection tasks.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let tls_acceptor = TlsAcceptor::from(Arc::new(load_tls_config(&self.config)?));

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        info!("Listening (TLS) on {}", self.config.listen_addr);

        let direct_listener = match &self.config.direct_ssh_listen_addr {
            Some(addr) => {
                let l = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind {}", addr))?;
                info!("Listening (plain SSH) on {}", addr);
                Some(l)
            }
            None => None,
        };

        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context("Accept failed")?;
                    let acceptor = tls_acceptor.clone();
                    let config = self.config.clone();
                    let ssh = self.ssh.clone();
                    let http = self.http.clone();
                    connections.spawn(async move {
                        handle_tls_connection(config, ssh, http, acceptor, stream, peer).await;
                    });
                }

                accepted = accept_optional(direct_listener.as_ref()) => {
                    let (stream, peer) = accepted.context("Accept failed")?;
                    debug!("Plain SSH connection from {}", peer);
                    let ssh = self.ssh.clone();
                    connections.spawn(async move {
                        ssh.serve(stream, peer).await;
                    });
                }

                // Reap finished connection tasks as they complete.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        // Listeners drop first (no new connections), then live sockets go.
        drop(listener);
        drop(direct_listener);
        info!("Shutting down {} open connection(s)", connections.len());
        connections.shutdown().await;
        Ok(())
    }
}

/// Accept on an optional listener; pends forever when absent so the
/// select arm never fires.
async fn accept_optional(
    listener: Option<&TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

async fn handle_tls_connection(
    config: Arc<GatewayConfig>,
    ssh: Arc<SshTunnelServer>,
    http: Arc<HttpApp>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let tls_stream = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            debug!("TLS handshake failed from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("TLS handshake timed out from {}", peer);
            return;
        }
    };

    let sni = tls_stream
        .get_ref()
        .1
        .server_name()
        .map(|name| name.to_owned());

    match route_for_sni(&config, sni.as_deref()) {
        RouteDecision::Ssh => {
            debug!("Routing {} (sni={:?}) to SSH", peer, sni);
            ssh.serve(tls_stream, peer).await;
        }
        RouteDecision::Http => {
            debug!("Routing {} (sni={:?}) to HTTP", peer, sni);
            http.serve_connection(tls_stream, peer).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig {
            base_hostname: "t.example.com".to_string(),
            ssh_hostnames: vec![
                "ssh.t.example.com".to_string(),
                "ssh-alt.t.example.com".to_string(),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_ssh_hostnames_route_to_ssh() {
        let config = config();
        for name in &config.ssh_hostnames.clone() {
            assert_eq!(
                route_for_sni(&config, Some(name)),
                RouteDecision::Ssh,
                "{name}"
            );
        }
    }

    #[test]
    fn test_everything_else_routes_to_http() {
        let config = config();
        assert_eq!(
            route_for_sni(&config, Some("web-env1.t.example.com")),
            RouteDecision::Http
        );
        assert_eq!(
            route_for_sni(&config, Some("t.example.com")),
            RouteDecision::Http
        );
        assert_eq!(
            route_for_sni(&config, Some("unknown.example.org")),
            RouteDecision::Http
        );
        // No SNI at all falls through to the default virtual host.
        assert_eq!(route_for_sni(&config, None), RouteDecision::Http);
    }
}
