//! The Router. Constructs one Relay Node per enabled service, keeps the
//! service→node assignment map, runs the ~5s status monitor (port discovery
//! every sixth tick), and handles seed rotation under sustained rate
//! limiting. Config is an `ArcSwap`-backed snapshot mutated only under a
//! single mutex, read lock-free everywhere else.

use crate::bridge::BridgeSupervisor;
use crate::config::{RelayRecord, RouterConfig, ServiceDef};
use crate::firewall;
use crate::identity;
use crate::relay::{AssignmentTable, RelayNode, RotationTrigger};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

fn now_ts() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Per-service snapshot for the admin `/status` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub node_id: String,
    pub address: Option<String>,
    pub up: bool,
}

pub struct Router {
    self_ref: Weak<Router>,
    config: Arc<ArcSwap<RouterConfig>>,
    config_mu: Mutex<()>,
    dirty: Arc<AtomicBool>,
    nodes: DashMap<String, Arc<RelayNode>>,
    bridges: DashMap<String, Arc<BridgeSupervisor>>,
    /// Service -> node-id, behind a single mutex rather than a sharded map:
    /// every mutation goes through one lock.
    assignments: RwLock<HashMap<String, String>>,
    /// Node-id -> current overlay address, if the bridge has one.
    addresses: RwLock<HashMap<String, Option<String>>>,
    /// Guards "exactly one rotation in flight per service".
    rotating: DashMap<String, ()>,
    handles: DashMap<String, Vec<JoinHandle<()>>>,
}

impl Router {
    pub async fn new(config: RouterConfig) -> Arc<Self> {
        let router = Arc::new_cyclic(|weak| Router {
            self_ref: weak.clone(),
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            config_mu: Mutex::new(()),
            dirty: Arc::new(AtomicBool::new(false)),
            nodes: DashMap::new(),
            bridges: DashMap::new(),
            assignments: RwLock::new(HashMap::new()),
            addresses: RwLock::new(HashMap::new()),
            rotating: DashMap::new(),
            handles: DashMap::new(),
        });
        router.bootstrap_services().await;
        router
    }

    pub fn shared_config(&self) -> Arc<ArcSwap<RouterConfig>> {
        self.config.clone()
    }

    pub fn shared_dirty_flag(&self) -> Arc<AtomicBool> {
        self.dirty.clone()
    }

    pub fn config_snapshot(&self) -> Arc<RouterConfig> {
        self.config.load_full()
    }

    pub fn status_snapshot(&self) -> HashMap<String, ServiceStatus> {
        let assignments = self.assignments.read().expect("assignment map poisoned").clone();
        let addresses = self.addresses.read().expect("address map poisoned").clone();
        assignments
            .into_iter()
            .map(|(service, node_id)| {
                let address = addresses.get(&node_id).cloned().flatten();
                let up = address.is_some();
                (service, ServiceStatus { node_id, address, up })
            })
            .collect()
    }

    /// Starts the ~5s status monitor / port-discovery loop. Returns the
    /// handle so the caller can fold it into its own shutdown bookkeeping.
    pub fn spawn_status_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move { router.status_monitor_loop().await })
    }

    /// Best-effort shutdown: signals every bridge to stop and aborts every
    /// task this router spawned. Bridges finish their current write, if
    /// any, before the child process is killed.
    pub fn shutdown(&self) {
        for entry in self.bridges.iter() {
            entry.value().shutdown();
        }
        for entry in self.handles.iter() {
            for h in entry.value() {
                h.abort();
            }
        }
    }

    async fn bootstrap_services(self: &Arc<Self>) {
        let cfg = self.config.load_full();
        let mut services: Vec<(String, ServiceDef)> = cfg
            .services
            .iter()
            .filter(|(name, _)| cfg.is_enabled(name))
            .map(|(name, def)| (name.clone(), def.clone()))
            .collect();
        services.sort_by(|a, b| a.0.cmp(&b.0));
        for (service, def) in services {
            let (seed, node_id) = self.identity_for(&service, &cfg).await;
            self.spawn_node(&service, &def, node_id, seed);
        }
    }

    async fn identity_for(&self, service: &str, cfg: &RouterConfig) -> (String, String) {
        if let Some(rec) = cfg.relays.get(service) {
            return (rec.seed.clone(), rec.name.clone());
        }
        let seed = identity::generate_seed_hex();
        let name = identity::derive_name(service, &seed);
        let record = RelayRecord {
            seed: seed.clone(),
            name: name.clone(),
            created_at: now_ts(),
            rotated_at: None,
        };
        let service = service.to_string();
        self.mutate_config(|c| {
            c.relays.insert(service.clone(), record.clone());
        })
        .await;
        self.mark_dirty();
        (seed, name)
    }

    fn spawn_node(self: &Arc<Self>, service: &str, def: &ServiceDef, node_id: String, seed_hex: String) {
        let cfg = self.config.load();
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (bridge, address_rx) = BridgeSupervisor::new(service, cfg.bridge.clone(), seed_hex, inbound_tx);
        bridge.start();

        let node = RelayNode::new(
            node_id.clone(),
            def,
            cfg.http.clone(),
            cfg.security.port_isolation_enabled,
            bridge.clone(),
            address_rx.clone(),
            self.clone() as Arc<dyn AssignmentTable>,
            self.clone() as Arc<dyn RotationTrigger>,
        );

        let mut handles = node.start(inbound_rx);
        handles.push(tokio::spawn(watch_address(
            self.clone(),
            node_id.clone(),
            address_rx,
        )));

        self.assignments
            .write()
            .expect("assignment map poisoned")
            .insert(service.to_string(), node_id.clone());
        self.addresses.write().expect("address map poisoned").insert(node_id, None);
        self.nodes.insert(service.to_string(), node);
        self.bridges.insert(service.to_string(), bridge);
        self.handles.insert(service.to_string(), handles);
    }

    async fn status_monitor_loop(self: Arc<Self>) {
        let mut tick: u64 = 0;
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            tick = tick.wrapping_add(1);
            self.log_status();
            if tick % 6 == 0 {
                self.run_port_discovery().await;
            }
        }
    }

    fn log_status(&self) {
        let addresses = self.addresses.read().expect("address map poisoned").clone();
        for entry in self.nodes.iter() {
            let up = addresses.get(&entry.value().node_id).cloned().flatten().is_some();
            tracing::info!(service = entry.key().as_str(), node_id = %entry.value().node_id, up, "status monitor tick");
        }
    }

    async fn run_port_discovery(self: &Arc<Self>) {
        let cfg = self.config.load_full();
        let services: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        for service in services {
            let Some(node) = self.nodes.get(&service).map(|e| e.value().clone()) else {
                continue;
            };
            let Some(log_path) = node.log_file().map(|p| p.to_path_buf()) else {
                continue;
            };
            let Some(def) = cfg.services.get(&service) else {
                continue;
            };
            let configured_host = firewall::request_port(&def.target)
                .map(|(host, _)| host)
                .unwrap_or_else(|| "127.0.0.1".to_string());

            if let Some(found) = firewall::periodic_sweep(&log_path, &configured_host, node.whitelist()).await {
                let new_target = format!("http://{}:{}", configured_host, found.port);
                node.realign_target(new_target.clone());
                metrics::counter!("router_port_isolation_grants_total").increment(1);

                let service_key = service.clone();
                let port = found.port;
                self.mutate_config(|c| {
                    if let Some(sd) = c.services.get_mut(&service_key) {
                        sd.target = new_target.clone();
                        if !sd.ports.contains(&port) {
                            sd.ports.push(port);
                        }
                    }
                })
                .await;
                self.mark_dirty();
                tracing::info!(service = %service, port = found.port, source = found.source, "periodic port discovery realigned target");
            }
        }
    }

    async fn rotate_service(self: Arc<Self>, service: String) {
        tracing::warn!(service = %service, "sustained rate limiting, rotating relay identity");
        metrics::counter!("router_rate_limit_rotations_total").increment(1);

        let cfg = self.config.load_full();
        let Some(def) = cfg.services.get(&service).cloned() else {
            tracing::warn!(service = %service, "rotation requested for an unknown service, ignoring");
            self.rotating.remove(&service);
            return;
        };

        if let Some((_, bridge)) = self.bridges.remove(&service) {
            bridge.shutdown();
        }
        if let Some((_, old_handles)) = self.handles.remove(&service) {
            for h in old_handles {
                h.abort();
            }
        }
        if let Some((_, old_node)) = self.nodes.remove(&service) {
            self.addresses.write().expect("address map poisoned").remove(&old_node.node_id);
        }

        let seed = identity::generate_seed_hex();
        let name = identity::derive_name(&service, &seed);
        let now = now_ts();
        let record = RelayRecord {
            seed: seed.clone(),
            name: name.clone(),
            created_at: now,
            rotated_at: Some(now),
        };
        let service_key = service.clone();
        self.mutate_config(|c| {
            c.relays.insert(service_key.clone(), record.clone());
        })
        .await;

        self.spawn_node(&service, &def, name.clone(), seed);
        self.mark_dirty();
        tracing::info!(service = %service, new_node = %name, "seed rotation complete");
        self.rotating.remove(&service);
    }

    async fn mutate_config(&self, f: impl FnOnce(&mut RouterConfig)) {
        let _guard = self.config_mu.lock().await;
        let mut next = (**self.config.load()).clone();
        f(&mut next);
        self.config.store(Arc::new(next));
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

async fn watch_address(router: Arc<Router>, node_id: String, mut rx: tokio::sync::watch::Receiver<Option<String>>) {
    loop {
        let val = rx.borrow().clone();
        router
            .addresses
            .write()
            .expect("address map poisoned")
            .insert(node_id.clone(), val.clone());
        if rx.changed().await.is_err() {
            break;
        }
    }
}

impl AssignmentTable for Router {
    fn owner_of(&self, service: &str) -> Option<String> {
        self.assignments.read().expect("assignment map poisoned").get(service).cloned()
    }

    fn address_of(&self, node_id: &str) -> Option<String> {
        self.addresses.read().expect("address map poisoned").get(node_id).cloned().flatten()
    }

    fn snapshot(&self) -> HashMap<String, String> {
        self.assignments.read().expect("assignment map poisoned").clone()
    }
}

impl RotationTrigger for Router {
    /// Guarded by `rotating` so exactly one rotation is in flight per
    /// service; a second trip of the accumulator while one is
    /// already running is a no-op.
    fn trigger_rotation(&self, service: &str) {
        if self.rotating.insert(service.to_string(), ()).is_some() {
            return;
        }
        let Some(router) = self.self_ref.upgrade() else { return };
        let service = service.to_string();
        tokio::spawn(async move { router.rotate_service(service).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;

    fn empty_config() -> RouterConfig {
        let mut cfg = RouterConfig::default();
        cfg.services.clear();
        cfg.enabled.clear();
        cfg
    }

    #[tokio::test]
    async fn router_with_no_services_has_an_empty_assignment_map() {
        let router = Router::new(empty_config()).await;
        assert!(router.status_snapshot().is_empty());
        assert!(router.snapshot().is_empty());
    }

    #[tokio::test]
    async fn unknown_service_lookup_returns_none() {
        let router = Router::new(empty_config()).await;
        assert_eq!(router.owner_of("nonexistent"), None);
        assert_eq!(router.address_of("nonexistent"), None);
    }

    #[tokio::test]
    async fn rotation_is_a_no_op_for_a_service_with_no_node() {
        let router = Router::new(empty_config()).await;
        router.trigger_rotation("ghost_service");
        // Give the spawned task a chance to run and observe the early return.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(router.owner_of("ghost_service").is_none());
    }
}
