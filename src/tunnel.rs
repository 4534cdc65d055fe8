//! Tunnel data model shared by the gateway and the agent.
//!
//! A `Forward` is the edge-side descriptor of one service port to expose;
//! its `external_name` is the public identity of the tunnel. The agent
//! ships the full forward list to the gateway in an `AgentRegistration`
//! payload over a small exec-based control surface (`hello` / `register`).

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::keys::validate_env_id;

/// Access level of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// Served without authentication.
    Public,
    /// Requires a valid per-environment session.
    #[default]
    Private,
}

/// A `<script>` tag to inject into proxied HTML responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptInjection {
    pub src: String,
    #[serde(default)]
    pub defer: bool,
    #[serde(default, rename = "async")]
    pub r#async: bool,
}

impl ScriptInjection {
    /// Render the tag exactly as it will appear in the response body.
    pub fn to_tag(&self) -> String {
        let mut attrs = String::new();
        if self.defer {
            attrs.push_str(" defer");
        }
        if self.r#async {
            attrs.push_str(" async");
        }
        format!("<script src=\"{}\"{}></script>", self.src, attrs)
    }
}

/// Edge-side descriptor of one internal service port to be tunneled.
///
/// Ephemeral: regenerated on every discovery cycle. Identity is the
/// `external_name`, never object identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forward {
    /// Host the agent dials to reach the service (compose DNS name).
    pub host: String,
    /// Service port inside the environment network.
    pub port: u16,
    /// Public tunnel name, unique within the gateway.
    pub external_name: String,
    pub access: Access,
    #[serde(default)]
    pub injects: Vec<ScriptInjection>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl Forward {
    /// The wire-level view the gateway needs (no agent-local dial info).
    pub fn spec(&self) -> ForwardSpec {
        ForwardSpec {
            external_name: self.external_name.clone(),
            access: self.access,
            injects: self.injects.clone(),
            meta: self.meta.clone(),
        }
    }
}

/// Gateway-facing slice of a [`Forward`], carried in the register payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub external_name: String,
    pub access: Access,
    #[serde(default)]
    pub injects: Vec<ScriptInjection>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

/// Full tunnel state the agent resubmits on every discovery change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub env_id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub access: Access,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(default)]
    pub forwards: Vec<ForwardSpec>,
}

impl AgentRegistration {
    /// Reject payloads whose forwards are not scoped to their own envId.
    pub fn validate(&self) -> Result<()> {
        validate_env_id(&self.env_id)?;
        for f in &self.forwards {
            if !name_belongs_to_env(&f.external_name, &self.env_id) {
                return Err(anyhow!(
                    "forward '{}' is not scoped to environment '{}'",
                    f.external_name,
                    self.env_id
                ));
            }
        }
        Ok(())
    }
}

/// Response to the agent's `hello` exec, sent as one JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    /// The client's identity as the gateway sees it (key thumbprint).
    pub client_id: String,
}

/// Sanitize a service name into a DNS-label-safe chunk.
fn sanitize_label(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "svc".to_string()
    } else {
        out
    }
}

/// Derive the public tunnel name for a service port.
///
/// `<service>-<envId>` when the port is unambiguous within the
/// environment, `<service>-<port>-<envId>` otherwise. Deterministic, so
/// reconnects and rediscoveries land on the same name.
pub fn external_name(service: &str, port: u16, env_id: &str, disambiguate_port: bool) -> String {
    let service = sanitize_label(service);
    if disambiguate_port {
        format!("{}-{}-{}", service, port, env_id)
    } else {
        format!("{}-{}", service, env_id)
    }
}

/// Whether a tunnel name is scoped to the given environment id.
pub fn name_belongs_to_env(name: &str, env_id: &str) -> bool {
    name.strip_suffix(env_id)
        .is_some_and(|rest| rest.ends_with('-') && rest.len() > 1)
}

/// Control commands the agent may issue over an exec channel.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    Hello,
    Register(AgentRegistration),
}

/// Parse an exec request into an agent command.
///
/// Anything that does not start with a known verb is not ours; the caller
/// rejects the exec. A malformed `register` payload is an error, not a
/// fall-through.
pub fn parse_agent_command(cmd: &str) -> Result<Option<AgentCommand>> {
    let trimmed = cmd.trim();
    if trimmed == "hello" {
        return Ok(Some(AgentCommand::Hello));
    }
    if let Some(payload) = trimmed.strip_prefix("register ") {
        let registration: AgentRegistration =
            serde_json::from_str(payload).context("Invalid register payload")?;
        registration.validate()?;
        return Ok(Some(AgentCommand::Register(registration)));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_name_single_port() {
        assert_eq!(external_name("web", 8080, "env1", false), "web-env1");
    }

    #[test]
    fn test_external_name_port_collision() {
        assert_eq!(external_name("web", 8080, "env1", true), "web-8080-env1");
        assert_eq!(external_name("api", 8080, "env1", true), "api-8080-env1");
    }

    #[test]
    fn test_external_name_sanitized() {
        assert_eq!(external_name("My_Service", 80, "env1", false), "my-service-env1");
        assert_eq!(external_name("db.main", 5432, "env1", false), "db-main-env1");
    }

    #[test]
    fn test_name_belongs_to_env() {
        assert!(name_belongs_to_env("web-env1", "env1"));
        assert!(name_belongs_to_env("web-8080-env1", "env1"));
        assert!(!name_belongs_to_env("web-env2", "env1"));
        // Suffix match alone is not enough: needs the separating dash.
        assert!(!name_belongs_to_env("webenv1", "env1"));
        assert!(!name_belongs_to_env("env1", "env1"));
    }

    #[test]
    fn test_parse_hello() {
        assert_eq!(parse_agent_command("hello").unwrap(), Some(AgentCommand::Hello));
        assert_eq!(parse_agent_command(" hello ").unwrap(), Some(AgentCommand::Hello));
    }

    #[test]
    fn test_parse_register() {
        let cmd = r#"register {"env_id":"env1","forwards":[{"external_name":"web-env1","access":"public"}]}"#;
        match parse_agent_command(cmd).unwrap() {
            Some(AgentCommand::Register(reg)) => {
                assert_eq!(reg.env_id, "env1");
                assert_eq!(reg.forwards.len(), 1);
                assert_eq!(reg.forwards[0].access, Access::Public);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_parse_register_rejects_foreign_forward() {
        let cmd = r#"register {"env_id":"env1","forwards":[{"external_name":"web-env2","access":"public"}]}"#;
        assert!(parse_agent_command(cmd).is_err());
    }

    #[test]
    fn test_parse_unknown_command() {
        assert_eq!(parse_agent_command("rm -rf /").unwrap(), None);
        assert_eq!(parse_agent_command("").unwrap(), None);
    }

    #[test]
    fn test_script_injection_tag() {
        let inject = ScriptInjection {
            src: "https://cdn.example.com/widget.js".into(),
            defer: true,
            r#async: false,
        };
        assert_eq!(
            inject.to_tag(),
            "<script src=\"https://cdn.example.com/widget.js\" defer></script>"
        );
    }
}
