//! Edge agent wiring: discovery feeds the SSH client, readiness is
//! recomputed per cycle, and a small HTTP API exposes the current state.
//!
//! The reconnect policy lives here: transport failures inside the client
//! are fatal per attempt and retried with exponential backoff, reset on a
//! successful connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{ConnectionConfig, TunnelClient};
use crate::config::AgentConfig;
use crate::discovery::{DiscoverySnapshot, DockerDiscovery};
use crate::keys;
use crate::reconcile::{reconcile, ComposeTunnelAgentState};
use crate::tunnel::AgentRegistration;

const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Shared state behind the agent API.
#[derive(Clone)]
pub struct AgentState {
    config: Arc<AgentConfig>,
    snapshot: watch::Receiver<DiscoverySnapshot>,
    readiness: watch::Receiver<ComposeTunnelAgentState>,
    connected: Arc<AtomicBool>,
}

/// Run the agent until cancelled.
pub async fn run(config: Arc<AgentConfig>, cancel: CancellationToken) -> Result<()> {
    let client_key = keys::load_or_generate_key(&config.client_key_path).await?;
    let connection_config = ConnectionConfig::from_agent(&config, client_key)?;

    let (snapshot_tx, snapshot_rx) = watch::channel(DiscoverySnapshot::default());
    let (readiness_tx, readiness_rx) = watch::channel(ComposeTunnelAgentState::Unknown {
        reason: "no discovery cycle yet".to_string(),
    });
    let connected = Arc::new(AtomicBool::new(false));

    // Discovery. The runtime being unreachable is a degraded state, not a
    // startup failure: keep retrying and report `unknown` meanwhile.
    let discovery_config = config.clone();
    let discovery_cancel = cancel.clone();
    let discovery_readiness = readiness_tx.clone();
    tokio::spawn(async move {
        loop {
            match DockerDiscovery::new(discovery_config.clone()).await {
                Ok(discovery) => {
                    if let Err(e) = discovery
                        .run(snapshot_tx.clone(), discovery_cancel.clone())
                        .await
                    {
                        warn!("Discovery stopped: {:#}", e);
                    }
                }
                Err(e) => {
                    warn!("Container runtime unreachable: {:#}", e);
                    let _ = discovery_readiness.send(ComposeTunnelAgentState::Unknown {
                        reason: format!("{e:#}"),
                    });
                }
            }
            if discovery_cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });

    // Readiness: recompute on every discovery cycle.
    let reconcile_config = config.clone();
    let mut reconcile_rx = snapshot_rx.clone();
    let reconcile_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reconcile_cancel.cancelled() => return,
                changed = reconcile_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let snapshot = reconcile_rx.borrow_and_update().clone();
                    let state = reconcile(
                        &reconcile_config.compose,
                        snapshot.error.as_deref(),
                        &snapshot.running_services,
                    );
                    let _ = readiness_tx.send(state);
                }
            }
        }
    });

    // Agent API.
    let api_state = AgentState {
        config: config.clone(),
        snapshot: snapshot_rx.clone(),
        readiness: readiness_rx,
        connected: connected.clone(),
    };
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind agent API on {}", config.listen_addr))?;
    info!("Agent API listening on {}", config.listen_addr);
    let api_cancel = cancel.clone();
    tokio::spawn(async move {
        let app = router(api_state);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_cancel.cancelled().await })
            .await
        {
            warn!("Agent API stopped: {}", e);
        }
    });

    // Tunnel connection with reconnect policy.
    let mut backoff = RECONNECT_INITIAL;
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        info!(
            "Connecting to gateway at {}:{}",
            connection_config.hostname, connection_config.port
        );
        match TunnelClient::connect(&connection_config).await {
            Ok((client, hello)) => {
                info!("Tunnel established (client id {})", hello.client_id);
                connected.store(true, Ordering::Relaxed);
                backoff = RECONNECT_INITIAL;

                let reason = sync_until_failure(client, &config, snapshot_rx.clone(), &cancel)
                    .await;
                connected.store(false, Ordering::Relaxed);

                if cancel.is_cancelled() {
                    return Ok(());
                }
                warn!("Tunnel connection lost: {}", reason);
            }
            Err(e) => {
                warn!(
                    "Connection attempt failed: {:#}, retrying in {}s",
                    e,
                    backoff.as_secs()
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

/// Drive one live connection: push the current forward set, then re-sync
/// on every discovery change until something fails or we're cancelled.
async fn sync_until_failure(
    mut client: TunnelClient,
    config: &AgentConfig,
    mut snapshot_rx: watch::Receiver<DiscoverySnapshot>,
    cancel: &CancellationToken,
) -> String {
    loop {
        let snapshot = snapshot_rx.borrow_and_update().clone();

        if let Err(e) = client.sync_forwards(&snapshot.forwards).await {
            return format!("forward sync failed: {e:#}");
        }

        let registration = AgentRegistration {
            env_id: config.env_id.clone(),
            hostname: None,
            access: config.default_access,
            meta: Default::default(),
            forwards: snapshot.forwards.iter().map(|f| f.spec()).collect(),
        };
        if let Err(e) = client.register(&registration).await {
            return format!("registration failed: {e:#}");
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = client.disconnect().await;
                return "cancelled".to_string();
            }
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    return "discovery channel closed".to_string();
                }
                if client.is_closed() {
                    return "connection closed".to_string();
                }
            }
        }
    }
}

fn router(state: AgentState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/forwards", get(forwards))
        .route("/machine-status", get(machine_status))
        .route("/env-metadata", get(env_metadata))
        .with_state(state)
}

/// `GET /healthz` — liveness plus tunnel connectivity.
async fn healthz(State(state): State<AgentState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "env_id": state.config.env_id,
        "tunnel_connected": state.connected.load(Ordering::Relaxed),
    }))
}

/// `GET /forwards` — current aggregated forward list and readiness.
async fn forwards(State(state): State<AgentState>) -> Json<Value> {
    let snapshot = state.snapshot.borrow().clone();
    let readiness = state.readiness.borrow().clone();
    Json(json!({
        "forwards": snapshot.forwards,
        "state": readiness,
    }))
}

/// `GET /machine-status` — run the configured diagnostic recipe.
async fn machine_status(State(state): State<AgentState>) -> impl IntoResponse {
    let Some(command) = state.config.machine_status_command.clone() else {
        return (StatusCode::NOT_FOUND, "no machine-status recipe configured\n").into_response();
    };
    let Some(program) = command.first() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "empty machine-status recipe\n")
            .into_response();
    };

    match tokio::process::Command::new(program)
        .args(&command[1..])
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let content_type = state
                .config
                .machine_status_content_type
                .clone()
                .unwrap_or_else(|| "text/plain; charset=utf-8".to_string());
            ([(header::CONTENT_TYPE, content_type)], output.stdout).into_response()
        }
        Ok(output) => {
            warn!(
                "machine-status recipe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "machine-status recipe failed\n")
                .into_response()
        }
        Err(e) => {
            warn!("machine-status recipe failed to start: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "machine-status recipe failed\n")
                .into_response()
        }
    }
}

/// `GET /env-metadata` — static metadata passthrough.
async fn env_metadata(State(state): State<AgentState>) -> impl IntoResponse {
    let Some(path) = &state.config.env_metadata_file else {
        return (StatusCode::NOT_FOUND, "no environment metadata configured\n").into_response();
    };

    match tokio::fs::read(path).await {
        Ok(content) => (
            [(header::CONTENT_TYPE, "application/json".to_string())],
            content,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to read env metadata {}: {}", path.display(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metadata unavailable\n").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{Access, Forward};
    use std::collections::HashMap;

    #[test]
    fn test_registration_mirrors_forward_list() {
        let forwards = vec![Forward {
            host: "web".into(),
            port: 8080,
            external_name: "web-env1".into(),
            access: Access::Public,
            injects: Vec::new(),
            meta: HashMap::new(),
        }];

        let registration = AgentRegistration {
            env_id: "env1".into(),
            hostname: None,
            access: Access::Private,
            meta: Default::default(),
            forwards: forwards.iter().map(|f| f.spec()).collect(),
        };

        assert!(registration.validate().is_ok());
        assert_eq!(registration.forwards.len(), 1);
        assert_eq!(registration.forwards[0].external_name, "web-env1");
        // The wire view drops the agent-local dial info.
        let encoded = serde_json::to_string(&registration).unwrap();
        assert!(!encoded.contains("8080"));
    }
}
