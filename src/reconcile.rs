//! Environment readiness reconciliation.
//!
//! Diffs the declared compose services against the services currently
//! running for the project. The result is one of three complete states,
//! never a partial view, and is recomputed after every discovery cycle.
//! Readiness is informational only: forwards are applied regardless.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::ComposeConfig;

/// Tri-state readiness of the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ComposeTunnelAgentState {
    /// Project identity or runtime state could not be determined.
    Unknown { reason: String },
    /// Declared services with zero running instances.
    Pending { pending_services: Vec<String> },
    Stable,
}

/// Compute readiness from the compose model and the running set.
pub fn reconcile(
    compose: &ComposeConfig,
    discovery_error: Option<&str>,
    running_services: &BTreeSet<String>,
) -> ComposeTunnelAgentState {
    if compose.project.is_none() {
        return ComposeTunnelAgentState::Unknown {
            reason: "compose project not configured".to_string(),
        };
    }

    if let Some(error) = discovery_error {
        return ComposeTunnelAgentState::Unknown {
            reason: error.to_string(),
        };
    }

    let pending: Vec<String> = compose
        .services
        .iter()
        .filter(|s| !running_services.contains(*s))
        .cloned()
        .collect();

    if pending.is_empty() {
        ComposeTunnelAgentState::Stable
    } else {
        ComposeTunnelAgentState::Pending {
            pending_services: pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compose(project: Option<&str>, services: &[&str]) -> ComposeConfig {
        ComposeConfig {
            project: project.map(String::from),
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn running(services: &[&str]) -> BTreeSet<String> {
        services.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pending_then_stable() {
        let model = compose(Some("proj"), &["web", "api"]);

        assert_eq!(
            reconcile(&model, None, &running(&["web"])),
            ComposeTunnelAgentState::Pending {
                pending_services: vec!["api".to_string()]
            }
        );

        assert_eq!(
            reconcile(&model, None, &running(&["web", "api"])),
            ComposeTunnelAgentState::Stable
        );
    }

    #[test]
    fn test_unknown_without_project() {
        let model = compose(None, &["web"]);
        assert!(matches!(
            reconcile(&model, None, &running(&["web"])),
            ComposeTunnelAgentState::Unknown { .. }
        ));
    }

    #[test]
    fn test_unknown_on_discovery_error() {
        let model = compose(Some("proj"), &["web"]);
        let state = reconcile(&model, Some("docker daemon unreachable"), &running(&["web"]));
        assert_eq!(
            state,
            ComposeTunnelAgentState::Unknown {
                reason: "docker daemon unreachable".to_string()
            }
        );
    }

    #[test]
    fn test_no_declared_services_is_stable() {
        let model = compose(Some("proj"), &[]);
        assert_eq!(reconcile(&model, None, &running(&[])), ComposeTunnelAgentState::Stable);
    }

    #[test]
    fn test_extra_running_services_ignored() {
        let model = compose(Some("proj"), &["web"]);
        assert_eq!(
            reconcile(&model, None, &running(&["web", "sidecar"])),
            ComposeTunnelAgentState::Stable
        );
    }
}
