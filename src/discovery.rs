//! Service discovery and forwards aggregation (edge side).
//!
//! Watches the container runtime for lifecycle events, collapses bursts
//! with a coalescing debounce window (one recomputation per burst, always
//! one forced at startup), converts running containers into a normalized
//! [`Forward`] list per source, and merges sources in the aggregator.
//! Snapshots are published through a `watch` channel, an explicit
//! subscribe/publish seam, no implicit event emitter.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bollard::query_parameters::{EventsOptionsBuilder, ListContainersOptionsBuilder};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::tunnel::{external_name, Access, Forward};

/// Compose labels the runtime stamps on project containers.
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Opt-in labels for containers outside the compose project.
const EXPOSE_LABEL: &str = "preview.expose";
const SERVICE_NAME_LABEL: &str = "preview.service";
const ACCESS_LABEL: &str = "preview.access";

/// Source identifiers; later-registered sources win name collisions.
pub const SOURCE_COMPOSE: &str = "compose-project";
pub const SOURCE_EXPOSED: &str = "exposed-label";

/// Result of one discovery cycle.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySnapshot {
    /// Aggregated forward list across all sources.
    pub forwards: Vec<Forward>,
    /// Services of the compose project with at least one running instance.
    pub running_services: BTreeSet<String>,
    /// Set when the runtime could not be read this cycle; forwards then
    /// carry the last known state.
    pub error: Option<String>,
}

/// Retains the last reported list per source and recomputes the union.
#[derive(Debug, Default)]
pub struct ForwardsAggregator {
    /// Source lists in registration order.
    sources: Vec<(String, Vec<Forward>)>,
}

impl ForwardsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace one source's contribution. An empty list removes exactly
    /// that source's forwards and nothing else.
    pub fn update(&mut self, source: &str, forwards: Vec<Forward>) {
        match self.sources.iter_mut().find(|(s, _)| s == source) {
            Some((_, list)) => *list = forwards,
            None => self.sources.push((source.to_string(), forwards)),
        }
    }

    /// Union of all sources, deduplicated by external name; a forward
    /// from a later-registered source wins a collision.
    pub fn aggregate(&self) -> Vec<Forward> {
        let mut merged: HashMap<String, Forward> = HashMap::new();
        for (_, list) in &self.sources {
            for f in list {
                merged.insert(f.external_name.clone(), f.clone());
            }
        }
        let mut out: Vec<Forward> = merged.into_values().collect();
        out.sort_by(|a, b| a.external_name.cmp(&b.external_name));
        out
    }
}

/// Event stream with a coalescing debounce window.
///
/// The first event of a burst starts the window; everything arriving
/// inside it collapses into the same recomputation, which runs after the
/// window closes (the guaranteed trailing run). Recomputation is serial in
/// the caller's loop, so discovery is single-flight per source set.
pub struct DebouncedEvents {
    rx: mpsc::Receiver<()>,
    window: Duration,
}

impl DebouncedEvents {
    pub fn new(rx: mpsc::Receiver<()>, window: Duration) -> Self {
        Self { rx, window }
    }

    /// Resolves once per burst; `false` when the event stream ended.
    pub async fn next_burst(&mut self) -> bool {
        if self.rx.recv().await.is_none() {
            return false;
        }

        let deadline = tokio::time::sleep(self.window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                more = self.rx.recv() => {
                    if more.is_none() {
                        return true;
                    }
                    // Still inside the window; keep draining.
                }
            }
        }
    }
}

/// A service worth of discovered ports, before naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub name: String,
    /// DNS name the agent dials (compose network alias).
    pub host: String,
    pub ports: Vec<u16>,
    pub access: Option<Access>,
}

/// Turn discovered services into forwards with deterministic names.
///
/// A service exposing several ports gets the port baked into each name;
/// single-port services keep the short `<service>-<envId>` form.
pub fn forwards_for_services(
    services: &[DiscoveredService],
    env_id: &str,
    default_access: Access,
    global_injects: &[crate::tunnel::ScriptInjection],
) -> Vec<Forward> {
    let mut out = Vec::new();
    for service in services {
        let disambiguate = service.ports.len() > 1;
        for &port in &service.ports {
            out.push(Forward {
                host: service.host.clone(),
                port,
                external_name: external_name(&service.name, port, env_id, disambiguate),
                access: service.access.unwrap_or(default_access),
                injects: global_injects.to_vec(),
                meta: HashMap::from([("service".to_string(), service.name.clone())]),
            });
        }
    }
    out
}

/// Container-runtime-backed discovery.
pub struct DockerDiscovery {
    docker: Docker,
    config: Arc<AgentConfig>,
}

impl DockerDiscovery {
    pub async fn new(config: Arc<AgentConfig>) -> Result<Self> {
        let docker = match &config.docker_socket {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("Failed to connect to Docker at {}", path))?,
            None => Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker daemon")?,
        };

        docker.ping().await.context("Failed to ping Docker daemon")?;
        info!("Connected to Docker daemon");

        Ok(Self { docker, config })
    }

    /// List running containers matching a label filter.
    async fn list_running(&self, label_filter: &str) -> Result<Vec<bollard::models::ContainerSummary>> {
        let filters: HashMap<String, Vec<String>> = HashMap::from([
            ("status".to_string(), vec!["running".to_string()]),
            ("label".to_string(), vec![label_filter.to_string()]),
        ]);

        let options = ListContainersOptionsBuilder::new()
            .all(false)
            .filters(&filters)
            .build();

        self.docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")
    }

    /// The compose-project source: every running container of the project
    /// becomes one service keyed by its compose service label.
    pub async fn scan_compose_project(
        &self,
    ) -> Result<(Vec<DiscoveredService>, BTreeSet<String>)> {
        let Some(project) = &self.config.compose.project else {
            return Ok((Vec::new(), BTreeSet::new()));
        };

        let containers = self
            .list_running(&format!("{}={}", COMPOSE_PROJECT_LABEL, project))
            .await?;

        let mut running = BTreeSet::new();
        let mut services: HashMap<String, DiscoveredService> = HashMap::new();

        for container in containers {
            let labels = container.labels.clone().unwrap_or_default();
            let Some(service) = labels.get(COMPOSE_SERVICE_LABEL).cloned() else {
                continue;
            };
            running.insert(service.clone());

            let access = labels.get(ACCESS_LABEL).and_then(|v| parse_access(v));
            let entry = services
                .entry(service.clone())
                .or_insert_with(|| DiscoveredService {
                    name: service.clone(),
                    host: service.clone(),
                    ports: Vec::new(),
                    access,
                });

            for port in container.ports.clone().unwrap_or_default() {
                if is_tcp(&port) && !entry.ports.contains(&port.private_port) {
                    entry.ports.push(port.private_port);
                }
            }
        }

        let mut list: Vec<DiscoveredService> = services.into_values().collect();
        for s in &mut list {
            s.ports.sort_unstable();
        }
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok((list, running))
    }

    /// The exposed-label source: any container that opted in, regardless
    /// of project.
    pub async fn scan_exposed(&self) -> Result<Vec<DiscoveredService>> {
        let containers = self
            .list_running(&format!("{}=true", EXPOSE_LABEL))
            .await?;

        let mut list = Vec::new();
        for container in containers {
            let labels = container.labels.clone().unwrap_or_default();
            let name = labels
                .get(SERVICE_NAME_LABEL)
                .cloned()
                .or_else(|| {
                    container
                        .names
                        .as_ref()
                        .and_then(|n| n.first())
                        .map(|n| n.trim_start_matches('/').to_string())
                });
            let Some(name) = name else { continue };

            let ports: Vec<u16> = container
                .ports
                .clone()
                .unwrap_or_default()
                .iter()
                .filter(|p| is_tcp(p))
                .map(|p| p.private_port)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if ports.is_empty() {
                continue;
            }

            list.push(DiscoveredService {
                host: name.clone(),
                name,
                ports,
                access: labels.get(ACCESS_LABEL).and_then(|v| parse_access(v)),
            });
        }

        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// One full discovery cycle across both sources.
    async fn scan_into(&self, aggregator: &mut ForwardsAggregator) -> DiscoverySnapshot {
        let config = &self.config;
        let mut error = None;
        let mut running_services = BTreeSet::new();

        match self.scan_compose_project().await {
            Ok((services, running)) => {
                running_services = running;
                aggregator.update(
                    SOURCE_COMPOSE,
                    forwards_for_services(
                        &services,
                        &config.env_id,
                        config.default_access,
                        &config.global_injects,
                    ),
                );
            }
            Err(e) => {
                warn!("Compose project scan failed: {:#}", e);
                error = Some(format!("{e:#}"));
            }
        }

        match self.scan_exposed().await {
            Ok(services) => {
                aggregator.update(
                    SOURCE_EXPOSED,
                    forwards_for_services(
                        &services,
                        &config.env_id,
                        config.default_access,
                        &config.global_injects,
                    ),
                );
            }
            Err(e) => {
                warn!("Exposed-label scan failed: {:#}", e);
                error.get_or_insert_with(|| format!("{e:#}"));
            }
        }

        DiscoverySnapshot {
            forwards: aggregator.aggregate(),
            running_services,
            error,
        }
    }

    /// Run discovery until cancelled, publishing snapshots on `tx`.
    pub async fn run(
        &self,
        tx: watch::Sender<DiscoverySnapshot>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (event_tx, event_rx) = mpsc::channel::<()>(64);
        let mut debounced =
            DebouncedEvents::new(event_rx, Duration::from_millis(self.config.debounce_ms));

        // Event pump: container lifecycle events tick the debouncer.
        let docker = self.docker.clone();
        let pump_cancel = cancel.clone();
        let pump = tokio::spawn(async move {
            loop {
                let filters: HashMap<String, Vec<String>> =
                    HashMap::from([("type".to_string(), vec!["container".to_string()])]);
                let options = EventsOptionsBuilder::new().filters(&filters).build();
                let mut events = docker.events(Some(options));

                loop {
                    tokio::select! {
                        _ = pump_cancel.cancelled() => return,
                        event = events.next() => match event {
                            Some(Ok(event)) => {
                                let action = event.action.as_deref().unwrap_or("");
                                if is_lifecycle_action(action) {
                                    debug!("Container event: {}", action);
                                    let _ = event_tx.try_send(());
                                }
                            }
                            Some(Err(e)) => {
                                warn!("Docker event stream error: {}", e);
                                break;
                            }
                            None => {
                                warn!("Docker event stream ended; resubscribing");
                                break;
                            }
                        }
                    }
                }

                // Runtime hiccup: back off, resubscribe, and force a scan
                // so state catches up with whatever was missed.
                tokio::time::sleep(Duration::from_secs(2)).await;
                let _ = event_tx.try_send(());
            }
        });

        let mut aggregator = ForwardsAggregator::new();

        // One recomputation is always forced immediately at startup.
        let snapshot = self.scan_into(&mut aggregator).await;
        let _ = tx.send(snapshot);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                got_burst = debounced.next_burst() => {
                    if !got_burst {
                        break;
                    }
                    let snapshot = self.scan_into(&mut aggregator).await;
                    let _ = tx.send(snapshot);
                }
            }
        }

        pump.abort();
        Ok(())
    }
}

fn parse_access(value: &str) -> Option<Access> {
    match value {
        "public" => Some(Access::Public),
        "private" => Some(Access::Private),
        _ => None,
    }
}

fn is_tcp(port: &bollard::models::Port) -> bool {
    use bollard::models::PortTypeEnum;
    matches!(port.typ, None | Some(PortTypeEnum::TCP))
}

fn is_lifecycle_action(action: &str) -> bool {
    matches!(
        action,
        "create" | "start" | "stop" | "pause" | "unpause" | "destroy" | "die" | "rename"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(name: &str) -> Forward {
        Forward {
            host: "svc".into(),
            port: 80,
            external_name: name.to_string(),
            access: Access::Public,
            injects: Vec::new(),
            meta: HashMap::new(),
        }
    }

    #[test]
    fn test_aggregator_burst_convergence() {
        // After a burst of updates from one source, the result equals
        // applying only the last one.
        let mut a = ForwardsAggregator::new();
        a.update("s1", vec![forward("a-env1")]);
        a.update("s1", vec![forward("b-env1")]);
        a.update("s1", vec![forward("c-env1")]);

        let mut b = ForwardsAggregator::new();
        b.update("s1", vec![forward("c-env1")]);

        assert_eq!(a.aggregate(), b.aggregate());
    }

    #[test]
    fn test_aggregator_preserves_other_sources() {
        let mut agg = ForwardsAggregator::new();
        agg.update("s1", vec![forward("a-env1")]);
        agg.update("s2", vec![forward("b-env1")]);

        // Updating s1 never touches s2's contribution.
        agg.update("s1", vec![forward("c-env1")]);
        let names: Vec<String> = agg
            .aggregate()
            .into_iter()
            .map(|f| f.external_name)
            .collect();
        assert_eq!(names, vec!["b-env1", "c-env1"]);

        // An empty report removes only that source's forwards.
        agg.update("s1", Vec::new());
        let names: Vec<String> = agg
            .aggregate()
            .into_iter()
            .map(|f| f.external_name)
            .collect();
        assert_eq!(names, vec!["b-env1"]);
    }

    #[test]
    fn test_aggregator_later_source_wins_collision() {
        let mut agg = ForwardsAggregator::new();
        let mut first = forward("web-env1");
        first.port = 1111;
        let mut second = forward("web-env1");
        second.port = 2222;

        agg.update("s1", vec![first]);
        agg.update("s2", vec![second]);

        let merged = agg.aggregate();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].port, 2222);
    }

    #[test]
    fn test_forward_naming_port_disambiguation() {
        let services = vec![
            DiscoveredService {
                name: "web".into(),
                host: "web".into(),
                ports: vec![8080],
                access: None,
            },
            DiscoveredService {
                name: "api".into(),
                host: "api".into(),
                ports: vec![3000, 9090],
                access: Some(Access::Public),
            },
        ];

        let forwards = forwards_for_services(&services, "env1", Access::Private, &[]);
        let names: Vec<&str> = forwards.iter().map(|f| f.external_name.as_str()).collect();
        assert_eq!(names, vec!["web-env1", "api-3000-env1", "api-9090-env1"]);

        assert_eq!(forwards[0].access, Access::Private);
        assert_eq!(forwards[1].access, Access::Public);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_burst_into_one_run() {
        let (tx, rx) = mpsc::channel(16);
        let mut debounced = DebouncedEvents::new(rx, Duration::from_millis(500));

        // A start and a stop for the same container land in one window.
        tx.send(()).await.unwrap();
        tx.send(()).await.unwrap();

        // One burst resolution consumes both events.
        assert!(debounced.next_burst().await);

        // No further events: the next burst is pending, not immediate.
        let pending = tokio::time::timeout(Duration::from_secs(5), debounced.next_burst());
        assert!(pending.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_trailing_event_fires_after_window() {
        let (tx, rx) = mpsc::channel(16);
        let mut debounced = DebouncedEvents::new(rx, Duration::from_millis(500));

        tx.send(()).await.unwrap();
        assert!(debounced.next_burst().await);

        // An event after the window closed starts a new burst.
        tx.send(()).await.unwrap();
        assert!(debounced.next_burst().await);
    }

    #[test]
    fn test_lifecycle_action_filter() {
        for action in ["create", "start", "stop", "pause", "unpause", "destroy", "die", "rename"] {
            assert!(is_lifecycle_action(action), "{action}");
        }
        assert!(!is_lifecycle_action("exec_start"));
        assert!(!is_lifecycle_action("health_status"));
    }
}
