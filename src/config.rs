//! Gateway and agent configuration loaded from TOML.
//!
//! The gateway follows the usual file-then-CLI-override flow. The agent
//! merges three layers with file > env > args precedence, each layer an
//! [`AgentOverrides`] applied field-by-field on top of the defaults.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::tunnel::{Access, ScriptInjection};

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// TLS listen address for the demultiplexed port (default: "0.0.0.0:8443")
    pub listen_addr: String,

    /// Base hostname under which tunnels get subdomains (e.g. "tunnel.example.com")
    pub base_hostname: String,

    /// SNI names routed to the SSH tunnel server instead of HTTP
    pub ssh_hostnames: Vec<String>,

    /// Optional plain-TCP SSH listener (SNI check bypassed)
    pub direct_ssh_listen_addr: Option<String>,

    /// TLS certificate chain (PEM); when unset a self-signed cert is generated
    pub tls_cert_path: Option<PathBuf>,

    /// TLS private key (PEM)
    pub tls_key_path: Option<PathBuf>,

    /// Path to the SSH host key
    pub host_key_path: PathBuf,

    /// Optional allow-list of client public keys; absent = open registration
    pub authorized_keys_path: Option<PathBuf>,

    /// Auth/session configuration
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("preview-gateway");

        Self {
            listen_addr: "0.0.0.0:8443".to_string(),
            base_hostname: "tunnel.localhost".to_string(),
            ssh_hostnames: vec!["ssh.tunnel.localhost".to_string()],
            direct_ssh_listen_addr: None,
            tls_cert_path: None,
            tls_key_path: None,
            host_key_path: data_dir.join("host_key"),
            authorized_keys_path: None,
            auth: AuthConfig::default(),
        }
    }
}

/// Session and login configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for session cookies and login tokens.
    /// Generated at startup when unset (sessions then die with the process).
    pub secret: Option<String>,

    /// Base URL of the SaaS identity provider's login flow.
    /// Unauthenticated requests to private tunnels 401 when unset.
    pub saas_login_url: Option<String>,

    /// Session lifetime in seconds.
    pub session_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            saas_login_url: None,
            session_ttl_secs: 60 * 60 * 24,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.host_key_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create host key directory: {}", parent.display())
            })?;
        }
        Ok(())
    }

    /// Whether an SNI name routes to the SSH tunnel server.
    pub fn is_ssh_hostname(&self, sni: &str) -> bool {
        self.ssh_hostnames.iter().any(|h| h.eq_ignore_ascii_case(sni))
    }
}

/// Parsed SSH target of the agent (`ssh://` or `ssh+tls://`).
///
/// Tagged by transport: the TLS shape and the plain shape never mix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshTarget {
    Plain {
        host: String,
        port: u16,
    },
    Tls {
        host: String,
        port: u16,
    },
}

impl SshTarget {
    pub fn parse(url: &str) -> Result<Self> {
        let (tls, rest) = if let Some(rest) = url.strip_prefix("ssh+tls://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("ssh://") {
            (false, rest)
        } else {
            return Err(anyhow!("Unsupported SSH URL scheme in '{}'", url));
        };

        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(anyhow!("Missing host in SSH URL '{}'", url));
        }

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("Invalid port in SSH URL '{}'", url))?;
                (host.to_string(), port)
            }
            None => (rest.to_string(), if tls { 443 } else { 22 }),
        };

        if host.is_empty() {
            return Err(anyhow!("Missing host in SSH URL '{}'", url));
        }

        Ok(if tls {
            SshTarget::Tls { host, port }
        } else {
            SshTarget::Plain { host, port }
        })
    }

    pub fn host(&self) -> &str {
        match self {
            SshTarget::Plain { host, .. } | SshTarget::Tls { host, .. } => host,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            SshTarget::Plain { port, .. } | SshTarget::Tls { port, .. } => *port,
        }
    }
}

/// Compose model inputs for the reconciler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ComposeConfig {
    /// Compose project name; discovery scopes to it and the reconciler
    /// reports `unknown` without it.
    pub project: Option<String>,

    /// Declared service names of the compose model.
    pub services: Vec<String>,
}

/// Resolved agent configuration. Immutable once the agent starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Gateway SSH endpoint, `ssh://host:port` or `ssh+tls://host:port`
    pub ssh_url: String,

    /// This environment's stable identifier
    pub env_id: String,

    /// Path to the agent's client private key
    pub client_key_path: PathBuf,

    /// Container runtime socket path (None = bollard local defaults)
    pub docker_socket: Option<String>,

    /// Access level applied to forwards that don't declare their own
    pub default_access: Access,

    /// Script injections applied to every forward
    pub global_injects: Vec<ScriptInjection>,

    /// Discovery debounce window in milliseconds
    pub debounce_ms: u64,

    /// Agent API listen address
    pub listen_addr: String,

    /// Optional diagnostic command for /machine-status
    pub machine_status_command: Option<Vec<String>>,

    /// Content type of the machine-status output
    pub machine_status_content_type: Option<String>,

    /// Static JSON served verbatim at /env-metadata
    pub env_metadata_file: Option<PathBuf>,

    /// Compose model (project identity + declared services)
    pub compose: ComposeConfig,

    /// SNI override for the TLS connection (defaults to the target host)
    pub tls_server_name: Option<String>,

    /// Skip TLS certificate verification (self-signed gateways)
    pub insecure_skip_verify: bool,

    /// Known gateway host keys in OpenSSH format; empty = trust on first use
    pub known_server_keys: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("preview-agent");

        Self {
            ssh_url: "ssh+tls://ssh.tunnel.localhost:8443".to_string(),
            env_id: String::new(),
            client_key_path: data_dir.join("client_key"),
            docker_socket: None,
            default_access: Access::Private,
            global_injects: Vec::new(),
            debounce_ms: 500,
            listen_addr: "127.0.0.1:7373".to_string(),
            machine_status_command: None,
            machine_status_content_type: None,
            env_metadata_file: None,
            compose: ComposeConfig::default(),
            tls_server_name: None,
            insecure_skip_verify: false,
            known_server_keys: Vec::new(),
        }
    }
}

/// One layer of agent configuration; unset fields fall through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOverrides {
    pub ssh_url: Option<String>,
    pub env_id: Option<String>,
    pub client_key_path: Option<PathBuf>,
    pub docker_socket: Option<String>,
    pub default_access: Option<Access>,
    pub global_injects: Option<Vec<ScriptInjection>>,
    pub debounce_ms: Option<u64>,
    pub listen_addr: Option<String>,
    pub machine_status_command: Option<Vec<String>>,
    pub machine_status_content_type: Option<String>,
    pub env_metadata_file: Option<PathBuf>,
    pub compose: Option<ComposeConfig>,
    pub tls_server_name: Option<String>,
    pub insecure_skip_verify: Option<bool>,
    pub known_server_keys: Option<Vec<String>>,
}

impl AgentOverrides {
    /// Read the `PREVIEW_*` environment variable layer.
    pub fn from_env() -> Self {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }

        Self {
            ssh_url: var("PREVIEW_SSH_URL"),
            env_id: var("PREVIEW_ENV_ID"),
            client_key_path: var("PREVIEW_CLIENT_KEY").map(PathBuf::from),
            docker_socket: var("PREVIEW_DOCKER_SOCKET"),
            default_access: var("PREVIEW_DEFAULT_ACCESS").and_then(|v| match v.as_str() {
                "public" => Some(Access::Public),
                "private" => Some(Access::Private),
                _ => None,
            }),
            global_injects: None,
            debounce_ms: var("PREVIEW_DEBOUNCE_MS").and_then(|v| v.parse().ok()),
            listen_addr: var("PREVIEW_LISTEN_ADDR"),
            machine_status_command: None,
            machine_status_content_type: None,
            env_metadata_file: var("PREVIEW_ENV_METADATA_FILE").map(PathBuf::from),
            compose: var("PREVIEW_COMPOSE_PROJECT").map(|project| ComposeConfig {
                project: Some(project),
                services: var("PREVIEW_COMPOSE_SERVICES")
                    .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
            }),
            tls_server_name: var("PREVIEW_TLS_SERVER_NAME"),
            insecure_skip_verify: var("PREVIEW_INSECURE_SKIP_VERIFY")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true")),
            known_server_keys: None,
        }
    }
}

impl AgentConfig {
    /// Apply one override layer on top of this config.
    fn apply(&mut self, o: AgentOverrides) {
        macro_rules! set {
            ($field:ident) => {
                if let Some(v) = o.$field {
                    self.$field = v;
                }
            };
        }
        set!(ssh_url);
        set!(env_id);
        set!(client_key_path);
        set!(default_access);
        set!(global_injects);
        set!(debounce_ms);
        set!(listen_addr);
        set!(compose);
        set!(insecure_skip_verify);
        set!(known_server_keys);
        if o.docker_socket.is_some() {
            self.docker_socket = o.docker_socket;
        }
        if o.machine_status_command.is_some() {
            self.machine_status_command = o.machine_status_command;
        }
        if o.machine_status_content_type.is_some() {
            self.machine_status_content_type = o.machine_status_content_type;
        }
        if o.env_metadata_file.is_some() {
            self.env_metadata_file = o.env_metadata_file;
        }
        if o.tls_server_name.is_some() {
            self.tls_server_name = o.tls_server_name;
        }
    }

    /// Merge the layers: defaults, then args, then env, then file. An
    /// explicit file setting beats env, which beats args.
    pub fn resolve(config_file: Option<&Path>, args: AgentOverrides) -> Result<Self> {
        let mut config = Self::default();
        config.apply(args);
        config.apply(AgentOverrides::from_env());

        if let Some(path) = config_file {
            if path.exists() {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                let file_layer: AgentOverrides = toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
                config.apply(file_layer);
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.env_id.is_empty() {
            return Err(anyhow!(
                "Environment id not configured (set env_id, PREVIEW_ENV_ID, or --env-id)"
            ));
        }
        crate::keys::validate_env_id(&self.env_id)?;
        SshTarget::parse(&self.ssh_url)?;
        Ok(())
    }

    /// The parsed SSH target; `resolve` already validated the URL.
    pub fn ssh_target(&self) -> Result<SshTarget> {
        SshTarget::parse(&self.ssh_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_target_parse() {
        assert_eq!(
            SshTarget::parse("ssh+tls://gw.example.com:8443").unwrap(),
            SshTarget::Tls {
                host: "gw.example.com".to_string(),
                port: 8443
            }
        );
        assert_eq!(
            SshTarget::parse("ssh://gw.example.com").unwrap(),
            SshTarget::Plain {
                host: "gw.example.com".to_string(),
                port: 22
            }
        );
        assert_eq!(
            SshTarget::parse("ssh+tls://gw.example.com").unwrap().port(),
            443
        );

        assert!(SshTarget::parse("http://gw.example.com").is_err());
        assert!(SshTarget::parse("ssh://").is_err());
        assert!(SshTarget::parse("ssh://host:notaport").is_err());
    }

    #[test]
    fn test_gateway_ssh_hostname_check() {
        let config = GatewayConfig {
            ssh_hostnames: vec!["ssh.tunnel.example.com".to_string()],
            ..Default::default()
        };
        assert!(config.is_ssh_hostname("ssh.tunnel.example.com"));
        assert!(config.is_ssh_hostname("SSH.Tunnel.Example.Com"));
        assert!(!config.is_ssh_hostname("web-env1.tunnel.example.com"));
    }

    #[test]
    fn test_agent_override_precedence() {
        let mut config = AgentConfig::default();
        config.apply(AgentOverrides {
            env_id: Some("from-args".to_string()),
            debounce_ms: Some(100),
            ..Default::default()
        });
        config.apply(AgentOverrides {
            env_id: Some("from-file".to_string()),
            ..Default::default()
        });

        // Later layer wins per field; untouched fields survive.
        assert_eq!(config.env_id, "from-file");
        assert_eq!(config.debounce_ms, 100);
    }

    #[test]
    fn test_agent_validate_requires_env_id() {
        let config = AgentConfig::default();
        assert!(config.validate().is_err());

        let config = AgentConfig {
            env_id: "env1".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
