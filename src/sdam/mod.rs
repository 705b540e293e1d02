//! The topology: a serialized FSM applier plus the per-address monitors and pools it owns
//! (§4.5, §4.6, §5). This is the top-level SDAM entry point the client talks to.

pub mod cluster_time;
pub mod description;
mod monitor;

use std::{collections::HashMap, sync::Arc, time::{Duration, Instant}};

use rand::seq::IteratorRandom;
use tokio::sync::{mpsc, watch, Mutex};

pub(crate) use self::monitor::{Monitor, MonitorHandle};
use self::{
    cluster_time::ClusterClock,
    description::{ServerDescription, ServerType, TopologyDescription},
};
use crate::{
    cmap::{Connection, ConnectionPool, Handshaker},
    error::{Error, ErrorKind, Result},
    event::{cmap::CmapEventHandler, sdam::{SdamEvent, SdamEventHandler}},
    options::{ClientOptions, Credential, ServerAddress},
    selection_criteria::{apply_latency_window, SelectionCriteria},
};

struct ServerHandle {
    pool: Arc<ConnectionPool>,
    monitor: Arc<MonitorHandle>,
}

struct TopologyActor {
    description: TopologyDescription,
    servers: HashMap<ServerAddress, ServerHandle>,
    options: Arc<ClientOptions>,
    handshaker: Arc<Handshaker>,
    credential: Option<Credential>,
    cmap_event_handler: Option<Arc<dyn CmapEventHandler>>,
    sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,
    publisher: watch::Sender<TopologyDescription>,
    update_tx: mpsc::UnboundedSender<ServerDescription>,
}

impl TopologyActor {
    fn ensure_monitor(&mut self, address: ServerAddress) {
        if self.servers.contains_key(&address) {
            return;
        }
        let pool = Arc::new(ConnectionPool::new(
            address.clone(),
            self.options.clone(),
            self.handshaker.clone(),
            self.credential.clone(),
            self.cmap_event_handler.clone(),
        ));
        ConnectionPool::spawn_background_maintenance(&pool);
        let (server_tx, mut server_rx) = watch::channel(ServerDescription::unknown(address.clone()));
        let monitor = Monitor::spawn(
            address.clone(),
            self.options.clone(),
            self.handshaker.clone(),
            pool.clone(),
            server_tx,
            self.sdam_event_handler.clone(),
        );

        let update_tx = self.update_tx.clone();
        tokio::spawn(async move {
            loop {
                if server_rx.changed().await.is_err() {
                    break;
                }
                let desc = server_rx.borrow().clone();
                if update_tx.send(desc).is_err() {
                    break;
                }
            }
        });

        if let Some(handler) = &self.sdam_event_handler {
            handler.handle_server_opening_event(SdamEvent::ServerOpening { address: address.clone() });
        }
        self.servers.insert(address, ServerHandle { pool, monitor });
    }

    fn reconcile_servers(&mut self) {
        let wanted: Vec<ServerAddress> = self.description.servers.keys().cloned().collect();
        for addr in &wanted {
            self.ensure_monitor(addr.clone());
        }
        let stale: Vec<ServerAddress> = self
            .servers
            .keys()
            .filter(|addr| !self.description.servers.contains_key(addr))
            .cloned()
            .collect();
        for addr in stale {
            if let Some(handle) = self.servers.remove(&addr) {
                handle.monitor.stop();
                if let Some(handler) = &self.sdam_event_handler {
                    handler.handle_server_closed_event(SdamEvent::ServerClosed { address: addr.clone() });
                }
                let pool = handle.pool;
                tokio::spawn(async move { pool.close().await });
            }
        }
    }

    fn apply(&mut self, incoming: ServerDescription) {
        let previous = self.description.clone();
        if let Some(prev_desc) = previous.servers.get(&incoming.address).cloned() {
            if let Some(handler) = &self.sdam_event_handler {
                handler.handle_server_description_changed_event(SdamEvent::ServerDescriptionChanged {
                    address: incoming.address.clone(),
                    previous: Box::new(prev_desc),
                    new: Box::new(incoming.clone()),
                });
            }
        }

        self.description = std::mem::replace(&mut self.description, TopologyDescription::new(&self.options)).apply(incoming);
        self.reconcile_servers();

        if let Some(handler) = &self.sdam_event_handler {
            handler.handle_topology_description_changed_event(SdamEvent::TopologyDescriptionChanged {
                previous: Box::new(previous),
                new: Box::new(self.description.clone()),
            });
        }
        let _ = self.publisher.send(self.description.clone());
    }
}

/// The client's aggregated view of a deployment: one [`TopologyDescription`] snapshot, kept
/// current by a single serialized applier task, plus the per-address monitors/pools that feed it
/// (§4.6, §5).
pub struct Topology {
    watch: watch::Receiver<TopologyDescription>,
    servers: Arc<Mutex<HashMap<ServerAddress, Arc<ConnectionPool>>>>,
    monitors: Arc<Mutex<HashMap<ServerAddress, Arc<MonitorHandle>>>>,
    options: Arc<ClientOptions>,
    cluster_clock: ClusterClock,
    update_tx: mpsc::UnboundedSender<ServerDescription>,
}

impl Topology {
    pub fn new(
        options: Arc<ClientOptions>,
        credential: Option<Credential>,
        cmap_event_handler: Option<Arc<dyn CmapEventHandler>>,
        sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,
    ) -> Self {
        let cmap_event_handler = crate::event::cmap::with_tracing(cmap_event_handler);
        let sdam_event_handler = crate::event::sdam::with_tracing(sdam_event_handler);
        let description = TopologyDescription::new(&options);
        let (publisher, watch) = watch::channel(description.clone());
        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let update_tx_for_errors = update_tx.clone();
        let handshaker = Arc::new(Handshaker::new(options.compressors.clone().unwrap_or_default()));

        if let Some(handler) = &sdam_event_handler {
            handler.handle_topology_opening_event(SdamEvent::TopologyOpening);
        }

        let mut actor = TopologyActor {
            description,
            servers: HashMap::new(),
            options: options.clone(),
            handshaker,
            credential,
            cmap_event_handler,
            sdam_event_handler,
            publisher,
            update_tx,
        };
        actor.reconcile_servers();

        let servers = Arc::new(Mutex::new(HashMap::new()));
        let monitors = Arc::new(Mutex::new(HashMap::new()));
        {
            let servers = servers.clone();
            let monitors = monitors.clone();
            // Seed the lookup maps synchronously so a `select()` call racing the very first
            // `reconcile_servers()` still observes the seed hosts.
            let seed_pools: HashMap<_, _> = actor
                .servers
                .iter()
                .map(|(addr, handle)| (addr.clone(), handle.pool.clone()))
                .collect();
            let seed_monitors: HashMap<_, _> = actor
                .servers
                .iter()
                .map(|(addr, handle)| (addr.clone(), handle.monitor.clone()))
                .collect();
            tokio::spawn(async move {
                *servers.lock().await = seed_pools;
                *monitors.lock().await = seed_monitors;
            });
        }

        {
            let servers = servers.clone();
            let monitors = monitors.clone();
            tokio::spawn(async move {
                while let Some(incoming) = update_rx.recv().await {
                    actor.apply(incoming);
                    let pools: HashMap<_, _> = actor
                        .servers
                        .iter()
                        .map(|(addr, handle)| (addr.clone(), handle.pool.clone()))
                        .collect();
                    let mons: HashMap<_, _> = actor
                        .servers
                        .iter()
                        .map(|(addr, handle)| (addr.clone(), handle.monitor.clone()))
                        .collect();
                    *servers.lock().await = pools;
                    *monitors.lock().await = mons;
                    for handle in actor.servers.values() {
                        handle.pool.mark_ready().await;
                    }
                }
            });
        }

        Topology {
            watch,
            servers,
            monitors,
            options,
            cluster_clock: ClusterClock::new(),
            update_tx: update_tx_for_errors,
        }
    }

    pub fn current(&self) -> TopologyDescription {
        self.watch.borrow().clone()
    }

    /// The shared cluster clock every command response and `hello` reply gossips into (§4.6,
    /// §4.8 step 4). Cheaply cloneable; all clones observe the same advances.
    pub fn cluster_clock(&self) -> &crate::sdam::cluster_time::ClusterClock {
        &self.cluster_clock
    }

    /// The server selection loop of §4.7: snapshot, filter, random pick, retry on race, block on
    /// topology changes while nothing matches, and time out.
    pub(crate) async fn select(&self, criteria: &SelectionCriteria) -> Result<(ServerAddress, Arc<ConnectionPool>)> {
        let deadline = Instant::now() + self.options.server_selection_timeout;
        let mut watch = self.watch.clone();

        loop {
            let topology = watch.borrow().clone();
            if let Some(err) = topology.compatibility_error() {
                return Err(err.into());
            }

            let candidates = topology.selectable_servers();
            let mut matched = criteria.select(&topology, &candidates);
            if matches!(criteria, SelectionCriteria::ReadPreference(_)) {
                matched = apply_latency_window(matched, self.options.local_threshold);
            }

            if let Some(chosen) = matched.iter().choose(&mut rand::rng()) {
                let servers = self.servers.lock().await;
                if let Some(pool) = servers.get(&chosen.address) {
                    return Ok((chosen.address.clone(), pool.clone()));
                }
                // The chosen address was removed between picking and connecting; restart.
                continue;
            }

            {
                let monitors = self.monitors.lock().await;
                for handle in monitors.values() {
                    handle.request_immediate_check();
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ErrorKind::ServerSelection {
                    message: format!(
                        "server selection timed out after {:?} with no server matching {criteria:?}",
                        self.options.server_selection_timeout
                    ),
                }
                .into());
            }
            if tokio::time::timeout(remaining, watch.changed()).await.is_err() {
                return Err(ErrorKind::ServerSelection {
                    message: format!(
                        "server selection timed out after {:?} with no server matching {criteria:?}",
                        self.options.server_selection_timeout
                    ),
                }
                .into());
            }
        }
    }

    pub async fn checkout_connection(&self, pool: &Arc<ConnectionPool>) -> Result<Connection> {
        let deadline = Instant::now() + self.options.server_selection_timeout;
        pool.checkout(Some(deadline)).await
    }

    /// Marks `address`'s server Unknown and drains its pool, per `Server.processError` (§4.8
    /// step 5, §8 boundary scenario 3). The Unknown description is published immediately rather
    /// than waiting for the monitor's next heartbeat round-trip, so a `select()` call already
    /// blocked on a topology change observes it right away.
    pub async fn process_error(&self, address: &ServerAddress, error: &Error) {
        let servers = self.servers.lock().await;
        if let Some(pool) = servers.get(address) {
            pool.drain(error).await;
        }
        drop(servers);

        let _ = self
            .update_tx
            .send(ServerDescription::with_error(address.clone(), error.clone()));

        let monitors = self.monitors.lock().await;
        if let Some(handle) = monitors.get(address) {
            handle.request_immediate_check();
        }
    }
}

impl Clone for Topology {
    fn clone(&self) -> Self {
        Topology {
            watch: self.watch.clone(),
            servers: self.servers.clone(),
            monitors: self.monitors.clone(),
            options: self.options.clone(),
            cluster_clock: self.cluster_clock.clone(),
            update_tx: self.update_tx.clone(),
        }
    }
}

#[allow(dead_code)]
fn is_data_bearing(server_type: ServerType) -> bool {
    server_type.is_data_bearing()
}
