//! SSH tunnel server implementation using russh.
//!
//! Handles:
//! - Public key authentication (optional allow-list, no passwords)
//! - The agent control surface over exec channels (`hello`, `register`)
//! - Named reverse forwards (tcpip-forward with the tunnel name as the
//!   address) that the proxy opens `forwarded-tcpip` channels against

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::keys::{self, public_key_to_openssh, thumbprint, validate_env_id};
use crate::registry::{ActiveTunnelEntry, ActiveTunnelRegistry};
use crate::tunnel::{name_belongs_to_env, parse_agent_command, AgentCommand, HelloResponse};

/// Registry instantiated with the SSH channel opener.
pub type Registry = ActiveTunnelRegistry<TunnelChannelOpener>;

/// Opens duplex streams over a connection's reverse-forwarded channels.
///
/// Carried inside each registry entry so the proxy can reach the agent
/// without knowing anything about the SSH session it rode in on.
#[derive(Clone)]
pub struct TunnelChannelOpener {
    handle: russh::server::Handle,
}

impl TunnelChannelOpener {
    /// Open a `forwarded-tcpip` channel named by the tunnel's external
    /// name and turn it into a byte stream.
    pub async fn open(
        &self,
        name: &str,
        peer: SocketAddr,
    ) -> Result<russh::ChannelStream<Msg>> {
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(
                name.to_string(),
                0,
                peer.ip().to_string(),
                peer.port() as u32,
            )
            .await
            .with_context(|| format!("Failed to open forwarded channel for '{}'", name))?;
        Ok(channel.into_stream())
    }
}

/// Deregisters a connection's entry when the connection goes away.
///
/// Keyed by connection id so teardown is idempotent and a reconnect that
/// already replaced the entry is never clobbered.
pub struct RegistrationGuard<C> {
    registry: Arc<ActiveTunnelRegistry<C>>,
    env_id: String,
    connection_id: u64,
}

impl<C> Drop for RegistrationGuard<C> {
    fn drop(&mut self) {
        self.registry
            .delete_if_connection(&self.env_id, self.connection_id);
    }
}

/// Shared state for the SSH tunnel server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<Registry>,
    /// Allow-list of client keys; `None` = open registration scoped by
    /// thumbprint.
    pub authorized_keys: Option<Vec<PublicKey>>,
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    server: Arc<ServerState>,
    peer_addr: SocketAddr,
    connection_id: u64,

    /// Environment id, parsed from the SSH username during auth.
    env_id: Option<String>,

    /// Authenticated client key (set once the signature verifies).
    client_key: Option<PublicKey>,

    /// Names announced via tcpip-forward on this connection.
    forwarded_names: HashSet<String>,

    /// Set on first successful registration; dropping it deregisters.
    guard: Option<RegistrationGuard<TunnelChannelOpener>>,
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr, connection_id: u64) -> Self {
        Self {
            server,
            peer_addr,
            connection_id,
            env_id: None,
            client_key: None,
            forwarded_names: HashSet::new(),
            guard: None,
        }
    }

    fn key_allowed(&self, key: &PublicKey) -> bool {
        match &self.server.authorized_keys {
            // Compare key material only; comments differ between the file
            // and the wire.
            Some(allowed) => allowed.iter().any(|k| k.key_data() == key.key_data()),
            None => true,
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Reply to an exec with output + exit status, then close the channel.
    async fn respond_exec(
        session: &mut Session,
        channel_id: ChannelId,
        exit_status: u32,
        output: String,
    ) -> Result<()> {
        // Confirm the exec request was accepted (clients set want-reply).
        session.channel_success(channel_id)?;

        let handle = session.handle();
        if !output.is_empty() {
            let _ = handle
                .data(channel_id, CryptoVec::from_slice(output.as_bytes()))
                .await;
        }
        let _ = handle.exit_status_request(channel_id, exit_status).await;
        let _ = handle.eof(channel_id).await;
        let _ = handle.close(channel_id).await;
        Ok(())
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Session channel opened: {:?}", channel.id());
        Ok(true)
    }

    /// Screen offered keys before asking the client for a signature.
    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Public key offered by user '{}' from {}", user, self.peer_addr);

        if let Err(e) = validate_env_id(user) {
            warn!("Rejecting auth with invalid environment id '{}': {}", user, e);
            return Ok(Self::reject());
        }

        if !self.key_allowed(public_key) {
            info!(
                "Key {} not in authorized keys (peer {})",
                thumbprint(public_key),
                self.peer_addr
            );
            return Ok(Self::reject());
        }

        Ok(Auth::Accept)
    }

    /// Signature verified: the connection is now bound to (env, key).
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if validate_env_id(user).is_err() || !self.key_allowed(public_key) {
            return Ok(Self::reject());
        }

        self.env_id = Some(user.to_string());
        self.client_key = Some(public_key.clone());

        info!(
            "Agent authenticated: env={} key={} peer={}",
            user,
            thumbprint(public_key),
            self.peer_addr
        );
        Ok(Auth::Accept)
    }

    /// The agent control surface: `hello` and `register <json>`.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        debug!("Exec request on channel {:?}: {}", channel_id, command);

        let client_key = self
            .client_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Not authenticated"))?;
        let env_id = self
            .env_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No environment id"))?;

        let parsed = match parse_agent_command(&command) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Malformed agent command from {}: {:#}", self.peer_addr, e);
                return Self::respond_exec(session, channel_id, 1, format!("error: {e:#}\n"))
                    .await;
            }
        };

        match parsed {
            Some(AgentCommand::Hello) => {
                let hello = HelloResponse {
                    client_id: thumbprint(client_key),
                };
                // Hello response is a single JSON line.
                let mut line = serde_json::to_string(&hello)?;
                line.push('\n');
                Self::respond_exec(session, channel_id, 0, line).await
            }
            Some(AgentCommand::Register(registration)) => {
                if registration.env_id != env_id {
                    warn!(
                        "Agent for env {} attempted to register env {}",
                        env_id, registration.env_id
                    );
                    return Self::respond_exec(
                        session,
                        channel_id,
                        1,
                        "error: registration env does not match connection\n".to_string(),
                    )
                    .await;
                }

                let entry = ActiveTunnelEntry {
                    env_id: env_id.clone(),
                    hostname: registration.hostname.clone(),
                    public_key: public_key_to_openssh(client_key),
                    thumbprint: thumbprint(client_key),
                    access: registration.access,
                    meta: registration.meta.clone(),
                    forwards: registration
                        .forwards
                        .iter()
                        .map(|f| (f.external_name.clone(), f.clone()))
                        .collect(),
                    connection_id: self.connection_id,
                    opener: TunnelChannelOpener {
                        handle: session.handle(),
                    },
                };

                info!(
                    "Registered tunnels for env {} ({} forwards, peer {})",
                    env_id,
                    registration.forwards.len(),
                    self.peer_addr
                );
                self.server.registry.put(env_id.clone(), entry);

                if self.guard.is_none() {
                    self.guard = Some(RegistrationGuard {
                        registry: self.server.registry.clone(),
                        env_id,
                        connection_id: self.connection_id,
                    });
                }

                Self::respond_exec(session, channel_id, 0, "{\"ok\":true}\n".to_string()).await
            }
            None => {
                Self::respond_exec(
                    session,
                    channel_id,
                    127,
                    format!("unknown command: {}\n", command.trim()),
                )
                .await
            }
        }
    }

    /// The agent announces one named reverse forward per tunnel. The
    /// address field carries the external name; no TCP listener is bound.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        _port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(env_id) = self.env_id.as_deref() else {
            return Ok(false);
        };

        if !name_belongs_to_env(address, env_id) {
            warn!(
                "Env {} attempted to forward foreign name '{}'",
                env_id, address
            );
            return Ok(false);
        }

        debug!("Forward announced: {} (env {})", address, env_id);
        self.forwarded_names.insert(address.to_string());
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let removed = self.forwarded_names.remove(address);
        if removed {
            debug!("Forward cancelled: {}", address);
        }
        Ok(removed)
    }
}

/// The SSH tunnel server; connections are handed to [`serve`](Self::serve)
/// by the demultiplexer rather than pulled from a listener here.
pub struct SshTunnelServer {
    russh_config: Arc<russh::server::Config>,
    state: Arc<ServerState>,
}

impl SshTunnelServer {
    pub async fn new(config: Arc<GatewayConfig>, registry: Arc<Registry>) -> Result<Self> {
        let key = keys::load_or_generate_key(&config.host_key_path).await?;

        let authorized_keys = match &config.authorized_keys_path {
            Some(path) if path.exists() => {
                let keys = keys::load_authorized_keys(path)?;
                info!("Loaded {} authorized client key(s)", keys.len());
                Some(keys)
            }
            Some(path) => {
                warn!(
                    "Authorized keys file {} not found; registration is open",
                    path.display()
                );
                None
            }
            None => None,
        };

        let russh_config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![key],
            ..Default::default()
        });

        Ok(Self {
            russh_config,
            state: Arc::new(ServerState {
                config,
                registry,
                authorized_keys,
            }),
        })
    }

    /// Serve one demultiplexed connection (TLS-wrapped or raw) until it
    /// ends. The caller owns the task, so cancelling it tears down the
    /// session and, through the registration guard, its registry entry.
    pub async fn serve<S>(&self, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = self.state.registry.next_connection_id();
        let handler = ConnectionHandler::new(self.state.clone(), peer_addr, connection_id);
        let russh_config = self.russh_config.clone();

        match russh::server::run_stream(russh_config, stream, handler).await {
            Ok(session) => {
                if let Err(e) = session.await {
                    warn!("SSH session ended with error (peer {}): {}", peer_addr, e);
                }
            }
            Err(e) => {
                warn!("SSH connection error (peer {}): {}", peer_addr, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::Access;
    use std::collections::HashMap;

    fn entry(env_id: &str, connection_id: u64) -> ActiveTunnelEntry<()> {
        ActiveTunnelEntry {
            env_id: env_id.to_string(),
            hostname: None,
            public_key: String::new(),
            thumbprint: "tp".to_string(),
            access: Access::Private,
            meta: HashMap::new(),
            forwards: HashMap::new(),
            connection_id,
            opener: (),
        }
    }

    #[test]
    fn test_registration_guard_releases_on_drop() {
        let registry = Arc::new(ActiveTunnelRegistry::new());
        registry.put("env1".into(), entry("env1", 7));

        let guard = RegistrationGuard {
            registry: registry.clone(),
            env_id: "env1".into(),
            connection_id: 7,
        };
        drop(guard);
        assert!(registry.get("env1").is_none());
    }

    #[test]
    fn test_registration_guard_spares_newer_connection() {
        let registry = Arc::new(ActiveTunnelRegistry::new());
        let guard = RegistrationGuard {
            registry: registry.clone(),
            env_id: "env1".into(),
            connection_id: 7,
        };

        // A reconnect registered a fresh entry before the old guard dropped.
        registry.put("env1".into(), entry("env1", 8));
        drop(guard);
        assert!(registry.get("env1").is_some());
    }
}
