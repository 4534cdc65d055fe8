//! Active tunnel registry.
//!
//! Gateway-side table of currently live tunnels, keyed by environment id
//! with secondary indexes by client-key thumbprint and by full tunnel
//! name. Entries are owned exclusively by this registry and replaced
//! atomically (`Arc` swap under the lock), so readers never observe a
//! partially written entry.
//!
//! The registry is generic over the channel-opener carried in each entry,
//! keeping the transport out of this module: the SSH layer registers
//! entries holding a live channel opener, tests use `()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::tunnel::{Access, ForwardSpec};

/// One live tunnel registration: a single environment served over one SSH
/// connection.
#[derive(Debug, Clone)]
pub struct ActiveTunnelEntry<C> {
    pub env_id: String,
    pub hostname: Option<String>,
    /// OpenSSH rendering of the client's public key.
    pub public_key: String,
    pub thumbprint: String,
    pub access: Access,
    pub meta: HashMap<String, String>,
    /// Declared forwards keyed by external name.
    pub forwards: HashMap<String, ForwardSpec>,
    /// Identifies the SSH connection that produced this entry, so a stale
    /// connection's teardown cannot clobber a newer registration.
    pub connection_id: u64,
    /// Opens a duplex stream over the entry's reverse-forwarded channel.
    pub opener: C,
}

/// Read-only projection for listing endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub env_id: String,
    pub name: String,
    pub access: Access,
    pub meta: HashMap<String, String>,
}

impl<C> ActiveTunnelEntry<C> {
    /// Effective access of a forward: the forward's own level wins over
    /// the environment default.
    pub fn forward_access(&self, name: &str) -> Option<Access> {
        self.forwards.get(name).map(|f| f.access)
    }
}

struct Inner<C> {
    by_env: HashMap<String, Arc<ActiveTunnelEntry<C>>>,
    /// thumbprint -> env ids (one client key can own several environments)
    by_thumbprint: HashMap<String, Vec<String>>,
    /// full tunnel name -> env id
    by_name: HashMap<String, String>,
}

/// Thread-safe registry of live tunnels.
pub struct ActiveTunnelRegistry<C> {
    inner: RwLock<Inner<C>>,
    connection_counter: AtomicU64,
}

impl<C> Default for ActiveTunnelRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ActiveTunnelRegistry<C> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_env: HashMap::new(),
                by_thumbprint: HashMap::new(),
                by_name: HashMap::new(),
            }),
            connection_counter: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a new SSH connection.
    pub fn next_connection_id(&self) -> u64 {
        self.connection_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or atomically replace the entry for an environment.
    ///
    /// At most one live entry per env id: a previous entry (from a
    /// reconnect or a re-registration) is fully unindexed first.
    pub fn put(&self, env_id: String, entry: ActiveTunnelEntry<C>) {
        let entry = Arc::new(entry);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        Self::unindex(&mut inner, &env_id);
        inner
            .by_thumbprint
            .entry(entry.thumbprint.clone())
            .or_default()
            .push(env_id.clone());
        for name in entry.forwards.keys() {
            inner.by_name.insert(name.clone(), env_id.clone());
        }
        inner.by_env.insert(env_id, entry);
    }

    /// Look up the live entry for an environment.
    pub fn get(&self, env_id: &str) -> Option<Arc<ActiveTunnelEntry<C>>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_env.get(env_id).cloned()
    }

    /// All live entries registered under a client-key thumbprint.
    pub fn get_by_thumbprint(&self, thumbprint: &str) -> Vec<Arc<ActiveTunnelEntry<C>>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .by_thumbprint
            .get(thumbprint)
            .map(|envs| {
                envs.iter()
                    .filter_map(|env| inner.by_env.get(env).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove an environment's entry unconditionally.
    pub fn delete(&self, env_id: &str) -> Option<Arc<ActiveTunnelEntry<C>>> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        Self::unindex(&mut inner, env_id)
    }

    /// Remove an environment's entry only if it still belongs to the given
    /// connection. Idempotent; used by per-connection teardown guards.
    pub fn delete_if_connection(&self, env_id: &str, connection_id: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let owned = inner
            .by_env
            .get(env_id)
            .is_some_and(|e| e.connection_id == connection_id);
        if owned {
            Self::unindex(&mut inner, env_id);
        }
    }

    /// Resolve a full tunnel name to its entry and declared forward.
    pub fn resolve_name(
        &self,
        name: &str,
    ) -> Option<(Arc<ActiveTunnelEntry<C>>, ForwardSpec)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let env_id = inner.by_name.get(name)?;
        let entry = inner.by_env.get(env_id)?.clone();
        let forward = entry.forwards.get(name)?.clone();
        Some((entry, forward))
    }

    /// Listing projection for a thumbprint's tunnels.
    pub fn list_tunnels(&self, thumbprint: &str) -> Vec<TunnelInfo> {
        self.get_by_thumbprint(thumbprint)
            .iter()
            .flat_map(|entry| {
                entry.forwards.values().map(|f| TunnelInfo {
                    env_id: entry.env_id.clone(),
                    name: f.external_name.clone(),
                    access: f.access,
                    meta: f.meta.clone(),
                })
            })
            .collect()
    }

    fn unindex(inner: &mut Inner<C>, env_id: &str) -> Option<Arc<ActiveTunnelEntry<C>>> {
        let entry = inner.by_env.remove(env_id)?;
        if let Some(envs) = inner.by_thumbprint.get_mut(&entry.thumbprint) {
            envs.retain(|e| e != env_id);
            if envs.is_empty() {
                inner.by_thumbprint.remove(&entry.thumbprint);
            }
        }
        inner.by_name.retain(|_, env| env != env_id);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(env_id: &str, thumbprint: &str, names: &[&str]) -> ActiveTunnelEntry<()> {
        ActiveTunnelEntry {
            env_id: env_id.to_string(),
            hostname: None,
            public_key: "ssh-ed25519 AAAA...".to_string(),
            thumbprint: thumbprint.to_string(),
            access: Access::Private,
            meta: HashMap::new(),
            forwards: names
                .iter()
                .map(|n| {
                    (
                        n.to_string(),
                        ForwardSpec {
                            external_name: n.to_string(),
                            access: Access::Public,
                            injects: Vec::new(),
                            meta: HashMap::new(),
                        },
                    )
                })
                .collect(),
            connection_id: 1,
            opener: (),
        }
    }

    #[test]
    fn test_put_get_delete() {
        let registry = ActiveTunnelRegistry::new();
        let e = entry("env1", "tp1", &["web-env1"]);
        registry.put("env1".into(), e);

        let got = registry.get("env1").expect("entry present");
        assert_eq!(got.thumbprint, "tp1");
        assert_eq!(registry.get_by_thumbprint("tp1").len(), 1);

        registry.delete("env1");
        assert!(registry.get("env1").is_none());
        assert!(registry.get_by_thumbprint("tp1").is_empty());
        assert!(registry.resolve_name("web-env1").is_none());
    }

    #[test]
    fn test_thumbprint_spans_environments() {
        let registry = ActiveTunnelRegistry::new();
        registry.put("env1".into(), entry("env1", "tp1", &["web-env1"]));
        registry.put("env2".into(), entry("env2", "tp1", &["web-env2"]));

        let entries = registry.get_by_thumbprint("tp1");
        assert_eq!(entries.len(), 2);

        registry.delete("env1");
        assert_eq!(registry.get_by_thumbprint("tp1").len(), 1);
    }

    #[test]
    fn test_put_replaces_atomically() {
        let registry = ActiveTunnelRegistry::new();
        registry.put("env1".into(), entry("env1", "tp1", &["web-env1", "api-env1"]));
        registry.put("env1".into(), entry("env1", "tp2", &["web-env1"]));

        // Old thumbprint and stale name index fully gone.
        assert!(registry.get_by_thumbprint("tp1").is_empty());
        assert!(registry.resolve_name("api-env1").is_none());
        let (e, f) = registry.resolve_name("web-env1").expect("resolves");
        assert_eq!(e.thumbprint, "tp2");
        assert_eq!(f.external_name, "web-env1");
    }

    #[test]
    fn test_delete_if_connection_guards_newer_entry() {
        let registry = ActiveTunnelRegistry::new();
        let mut old = entry("env1", "tp1", &["web-env1"]);
        old.connection_id = 1;
        registry.put("env1".into(), old);

        let mut new = entry("env1", "tp1", &["web-env1"]);
        new.connection_id = 2;
        registry.put("env1".into(), new);

        // Teardown of the old connection must not remove the new entry.
        registry.delete_if_connection("env1", 1);
        assert!(registry.get("env1").is_some());

        registry.delete_if_connection("env1", 2);
        assert!(registry.get("env1").is_none());
        // Idempotent.
        registry.delete_if_connection("env1", 2);
    }
}
