//! SSH protocol client for the edge agent.
//!
//! Opens the outbound connection to the gateway (plain TCP or TLS with
//! SNI), authenticates with the agent's key pair, performs the hello
//! handshake, and manages one named reverse forward per tunnel. Incoming
//! `forwarded-tcpip` channels are dialed through to the local service and
//! piped bidirectionally.
//!
//! Host-key verification is a tri-state result surfaced by
//! [`check_connection`]: the caller (not this module) decides whether an
//! unverified key means trust-on-first-use or abort. The observation
//! resolves on the first `check_server_key` callback; russh invokes it
//! once per handshake, so first-callback-wins is the intended
//! trust-on-first-use behavior rather than a race.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use russh::client::{self, AuthResult, Handle};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, SshTarget};
use crate::keys::{parse_openssh_public_key, public_key_to_openssh};
use crate::tunnel::{AgentRegistration, Forward, HelloResponse};

const OPERATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Transport shape of the connection. Tagged union: the TLS fields exist
/// only in the TLS shape.
#[derive(Debug, Clone)]
pub enum TlsMode {
    Plain,
    Tls {
        /// SNI name; defaults to the target hostname.
        server_name: Option<String>,
        insecure_skip_verify: bool,
    },
}

/// Everything needed for one connection attempt. Immutable once built.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    /// SSH username; carries the environment id.
    pub username: String,
    pub client_key: Arc<russh::keys::PrivateKey>,
    pub tls: TlsMode,
    pub known_server_keys: Vec<PublicKey>,
}

impl ConnectionConfig {
    /// Build from the resolved agent config and its loaded client key.
    pub fn from_agent(config: &AgentConfig, client_key: russh::keys::PrivateKey) -> Result<Self> {
        let target = config.ssh_target()?;
        let tls = match &target {
            SshTarget::Plain { .. } => TlsMode::Plain,
            SshTarget::Tls { .. } => TlsMode::Tls {
                server_name: config.tls_server_name.clone(),
                insecure_skip_verify: config.insecure_skip_verify,
            },
        };

        let known_server_keys = config
            .known_server_keys
            .iter()
            .map(|line| parse_openssh_public_key(line))
            .collect::<Result<Vec<_>>>()
            .context("Invalid known server key")?;

        Ok(Self {
            hostname: target.host().to_string(),
            port: target.port(),
            username: config.env_id.clone(),
            client_key: Arc::new(client_key),
            tls,
            known_server_keys,
        })
    }
}

/// What the handshake learned about the gateway's host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyObservation {
    /// The presented key matched a known server key.
    Verified,
    /// The presented key was not in the allow-list (or none was given).
    Unverified { key: String },
}

/// Tri-state outcome of a connection check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCheck {
    /// Connected, authenticated, and the host key is known.
    Verified,
    /// The connection works but the host key is not pinned; the caller
    /// decides whether to trust it.
    UnverifiedHostKey { key: String },
    /// The attempt failed outright.
    Error { message: String },
}

struct ClientHandler {
    known_server_keys: Vec<PublicKey>,
    /// First observation wins; later callbacks never overwrite it.
    observation: Arc<Mutex<Option<HostKeyObservation>>>,
    /// Reject unknown host keys instead of recording them.
    enforce_known_keys: bool,
    /// external name -> (host, port) dial targets for incoming channels.
    forwards: Arc<Mutex<HashMap<String, (String, u16)>>>,
}

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let verified = self
            .known_server_keys
            .iter()
            .any(|k| k.key_data() == server_public_key.key_data());

        let observation = if verified {
            HostKeyObservation::Verified
        } else {
            HostKeyObservation::Unverified {
                key: public_key_to_openssh(server_public_key),
            }
        };

        let mut slot = self.observation.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(observation);
        }
        drop(slot);

        if self.enforce_known_keys && !verified {
            warn!("Gateway host key not in known keys; refusing connection");
            return Ok(false);
        }
        Ok(true)
    }

    /// The gateway opened a channel for one of our named forwards; dial
    /// the local service and pipe bytes until either side closes.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        _connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let target = self
            .forwards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(connected_address)
            .cloned();

        let Some((host, port)) = target else {
            debug!(
                "Dropping channel for unknown forward '{}'",
                connected_address
            );
            return Ok(());
        };

        debug!(
            "Forward channel {} -> {}:{} (origin {}:{})",
            connected_address, host, port, originator_address, originator_port
        );

        let name = connected_address.to_string();
        tokio::spawn(async move {
            // The channel stream closes on drop, so every exit path of
            // this task releases the forwarded channel.
            let mut channel_stream = channel.into_stream();
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(mut local) => {
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut channel_stream, &mut local).await
                    {
                        debug!("Forward '{}' stream ended: {}", name, e);
                    }
                }
                Err(e) => {
                    warn!("Forward '{}' failed to dial {}:{}: {}", name, host, port, e);
                }
            }
        });

        Ok(())
    }
}

/// A live, authenticated tunnel connection to the gateway.
pub struct TunnelClient {
    handle: Handle<ClientHandler>,
    forwards: Arc<Mutex<HashMap<String, (String, u16)>>>,
    active_names: HashSet<String>,
    observation: Arc<Mutex<Option<HostKeyObservation>>>,
}

impl TunnelClient {
    /// Connect, verify, authenticate, and run the hello handshake.
    ///
    /// With known server keys configured, a mismatching host key aborts
    /// the connection; use [`check_connection`] first for the
    /// trust-on-first-use flow.
    pub async fn connect(config: &ConnectionConfig) -> Result<(Self, HelloResponse)> {
        Self::connect_inner(config, !config.known_server_keys.is_empty()).await
    }

    async fn connect_inner(
        config: &ConnectionConfig,
        enforce_known_keys: bool,
    ) -> Result<(Self, HelloResponse)> {
        let observation = Arc::new(Mutex::new(None));
        let forwards = Arc::new(Mutex::new(HashMap::new()));

        let handler = ClientHandler {
            known_server_keys: config.known_server_keys.clone(),
            observation: observation.clone(),
            enforce_known_keys,
            forwards: forwards.clone(),
        };

        let mut handle = dial(config, handler).await?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .context("Failed to negotiate signature algorithm")?
            .flatten();
        let auth = handle
            .authenticate_publickey(
                config.username.clone(),
                PrivateKeyWithHashAlg::new(config.client_key.clone(), hash_alg),
            )
            .await
            .context("Public key authentication failed")?;

        match auth {
            AuthResult::Success => {}
            AuthResult::Failure { .. } => {
                return Err(anyhow!(
                    "Gateway rejected the client key for environment '{}'",
                    config.username
                ));
            }
        }

        let mut client = Self {
            handle,
            forwards,
            active_names: HashSet::new(),
            observation,
        };

        // A reply proves the duplex channel works before any forwards are
        // trusted; no reply within the operation lifetime is terminal.
        let hello = timeout(OPERATION_TIMEOUT, client.hello())
            .await
            .map_err(|_| anyhow!("Timed out waiting for hello response"))??;

        info!("Connected to gateway as client {}", hello.client_id);
        Ok((client, hello))
    }

    /// What the handshake observed about the gateway's host key.
    pub fn host_key_observation(&self) -> Option<HostKeyObservation> {
        self.observation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn hello(&mut self) -> Result<HelloResponse> {
        let output = self.exec("hello").await?;
        let line = output
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| anyhow!("Empty hello response"))?;
        serde_json::from_str(line).context("Malformed hello response")
    }

    /// Resubmit the full tunnel state.
    pub async fn register(&mut self, registration: &AgentRegistration) -> Result<()> {
        let payload = serde_json::to_string(registration)?;
        let output = timeout(
            OPERATION_TIMEOUT,
            self.exec(&format!("register {}", payload)),
        )
        .await
        .map_err(|_| anyhow!("Timed out waiting for register response"))??;
        debug!("Register acknowledged: {}", output.trim());
        Ok(())
    }

    /// Reconcile the announced forward set with the given list: update
    /// dial targets, announce new names, cancel dropped ones.
    pub async fn sync_forwards(&mut self, forwards: &[Forward]) -> Result<()> {
        {
            let mut map = self.forwards.lock().unwrap_or_else(|e| e.into_inner());
            map.clear();
            for f in forwards {
                map.insert(f.external_name.clone(), (f.host.clone(), f.port));
            }
        }

        let wanted: HashSet<String> =
            forwards.iter().map(|f| f.external_name.clone()).collect();
        let to_add: Vec<String> = wanted.difference(&self.active_names).cloned().collect();
        let to_remove: Vec<String> = self.active_names.difference(&wanted).cloned().collect();

        for name in to_add {
            let accepted = self
                .handle
                .tcpip_forward(name.clone(), 0)
                .await
                .with_context(|| format!("Failed to announce forward '{name}'"))?;
            debug!(forward = %name, result = ?accepted, "Announced forward");
            self.active_names.insert(name);
        }

        for name in to_remove {
            if let Err(e) = self.handle.cancel_tcpip_forward(name.clone(), 0).await {
                warn!("Failed to cancel forward '{}': {}", name, e);
            }
            self.active_names.remove(&name);
        }

        Ok(())
    }

    /// Gracefully close the connection; the gateway tears down all of
    /// this connection's forwards and its registry entry.
    pub async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .context("Disconnect failed")
    }

    /// Whether the underlying connection is gone.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Run one exec command and collect its output until channel close.
    async fn exec(&mut self, command: &str) -> Result<String> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .context("Failed to open session channel")?;
        channel
            .exec(true, command.as_bytes())
            .await
            .context("Exec request failed")?;

        let mut output = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        let output = String::from_utf8_lossy(&output).into_owned();
        match exit_status {
            Some(0) | None => Ok(output),
            Some(code) => Err(anyhow!(
                "Command '{}' failed with status {}: {}",
                command.split_whitespace().next().unwrap_or(command),
                code,
                output.trim()
            )),
        }
    }
}

/// Check connectivity and host-key trust without keeping the connection.
///
/// Unknown host keys are surfaced as [`ConnectionCheck::UnverifiedHostKey`]
/// rather than failing the check, so the caller can choose pin-or-abort.
pub async fn check_connection(config: &ConnectionConfig) -> ConnectionCheck {
    match TunnelClient::connect_inner(config, false).await {
        Ok((client, _)) => {
            let observation = client.host_key_observation();
            let _ = client.disconnect().await;
            match observation {
                Some(HostKeyObservation::Verified) => ConnectionCheck::Verified,
                Some(HostKeyObservation::Unverified { key }) => {
                    ConnectionCheck::UnverifiedHostKey { key }
                }
                None => ConnectionCheck::Error {
                    message: "Handshake completed without host key callback".to_string(),
                },
            }
        }
        Err(e) => ConnectionCheck::Error {
            message: format!("{e:#}"),
        },
    }
}

/// Dial the TCP (and optionally TLS) transport, then start SSH on it.
async fn dial(config: &ConnectionConfig, handler: ClientHandler) -> Result<Handle<ClientHandler>> {
    let ssh_config = Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        nodelay: true,
        ..Default::default()
    });

    let addr = (config.hostname.as_str(), config.port);
    let tcp = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", config.hostname, config.port))?;

    match &config.tls {
        TlsMode::Plain => client::connect_stream(ssh_config, tcp, handler)
            .await
            .context("SSH handshake failed"),
        TlsMode::Tls {
            server_name,
            insecure_skip_verify,
        } => {
            let tls_config = client_tls_config(*insecure_skip_verify)?;
            let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
            let sni = server_name.clone().unwrap_or_else(|| config.hostname.clone());
            let domain = rustls::pki_types::ServerName::try_from(sni.clone())
                .with_context(|| format!("Invalid TLS server name '{}'", sni))?;
            let tls = connector
                .connect(domain, tcp)
                .await
                .context("TLS handshake failed")?;
            client::connect_stream(ssh_config, tls, handler)
                .await
                .context("SSH handshake failed")
        }
    }
}

fn client_tls_config(insecure_skip_verify: bool) -> Result<rustls::ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    let mut tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if insecure_skip_verify {
        warn!("TLS certificate verification disabled");
        tls_config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    Ok(tls_config)
}

/// Skips certificate verification; host trust comes from SSH key pinning.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl a";

    fn observation_for(known: &[PublicKey], presented: &PublicKey) -> HostKeyObservation {
        // Mirrors the classification in check_server_key.
        if known.iter().any(|k| k.key_data() == presented.key_data()) {
            HostKeyObservation::Verified
        } else {
            HostKeyObservation::Unverified {
                key: public_key_to_openssh(presented),
            }
        }
    }

    #[test]
    fn test_host_key_classification() {
        let key = parse_openssh_public_key(KEY_A).unwrap();

        assert_eq!(
            observation_for(std::slice::from_ref(&key), &key),
            HostKeyObservation::Verified
        );
        // Empty allow-list: unverified, caller decides (trust on first use).
        assert!(matches!(
            observation_for(&[], &key),
            HostKeyObservation::Unverified { .. }
        ));
    }

    #[test]
    fn test_connection_config_shapes() {
        let config = AgentConfig {
            env_id: "env1".to_string(),
            ssh_url: "ssh://gw:2222".to_string(),
            ..Default::default()
        };
        let key = russh::keys::PrivateKey::random(
            &mut russh::keys::ssh_key::rand_core::OsRng,
            russh::keys::ssh_key::Algorithm::Ed25519,
        )
        .unwrap();
        let conn = ConnectionConfig::from_agent(&config, key.clone()).unwrap();
        assert!(matches!(conn.tls, TlsMode::Plain));
        assert_eq!(conn.username, "env1");
        assert_eq!(conn.port, 2222);

        let config = AgentConfig {
            env_id: "env1".to_string(),
            ssh_url: "ssh+tls://gw:8443".to_string(),
            insecure_skip_verify: true,
            ..Default::default()
        };
        let conn = ConnectionConfig::from_agent(&config, key).unwrap();
        match conn.tls {
            TlsMode::Tls {
                insecure_skip_verify,
                ..
            } => assert!(insecure_skip_verify),
            TlsMode::Plain => panic!("expected TLS shape"),
        }
    }
}
