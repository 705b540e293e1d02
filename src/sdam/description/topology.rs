//! The topology (cluster) state machine (§4.6): `TopologyDescription` and the pure `apply`
//! transition function.

use std::collections::HashMap;

use bson::oid::ObjectId;

use super::server::{ServerDescription, ServerType};
use crate::{
    error::ErrorKind,
    options::{ClientOptions, ServerAddress},
    sdam::cluster_time::ClusterTime,
};

/// The oldest and newest wire protocol versions this crate speaks, used by the compatibility
/// check (§4.6). A server outside this range makes the whole topology `compatible=false`.
pub const CLIENT_MIN_WIRE_VERSION: i32 = 0;
pub const CLIENT_MAX_WIRE_VERSION: i32 = 25;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TopologyType {
    Unknown,
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    LoadBalanced,
}

#[derive(Clone, Debug)]
pub struct TopologyDescription {
    pub kind: TopologyType,
    pub set_name: Option<String>,
    pub max_set_version: Option<i32>,
    pub max_election_id: Option<ObjectId>,
    pub compatible: bool,
    pub compatibility_error: Option<String>,
    pub servers: HashMap<ServerAddress, ServerDescription>,
    pub session_timeout_minutes: Option<i64>,
    pub cluster_time: Option<ClusterTime>,
}

impl TopologyDescription {
    /// The initial topology description for a freshly-constructed client: every seed host is
    /// entered as `Unknown`, and the starting `TopologyType` is decided by `directConnection` /
    /// single-seed-without-replicaSet / `loadBalanced` / `replicaSet` per §4.6.
    pub fn new(options: &ClientOptions) -> Self {
        let kind = if options.load_balanced == Some(true) {
            TopologyType::LoadBalanced
        } else if options.is_direct() {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        let servers = options
            .hosts
            .iter()
            .cloned()
            .map(|addr| (addr.clone(), ServerDescription::unknown(addr)))
            .collect();

        TopologyDescription {
            kind,
            set_name: options.repl_set_name.clone(),
            max_set_version: None,
            max_election_id: None,
            compatible: true,
            compatibility_error: None,
            servers,
            session_timeout_minutes: None,
            cluster_time: None,
        }
    }

    fn data_bearing_servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values().filter(|s| s.server_type.is_data_bearing())
    }

    /// The minimum `logicalSessionTimeoutMinutes` among data-bearing members; `None` if any
    /// data-bearing member lacks the field, which disables sessions cluster-wide (§4.6).
    fn recompute_session_timeout(&mut self) {
        let mut members = self.data_bearing_servers().peekable();
        if members.peek().is_none() {
            self.session_timeout_minutes = None;
            return;
        }
        self.session_timeout_minutes = self
            .servers
            .values()
            .filter(|s| s.server_type.is_data_bearing())
            .map(|s| s.logical_session_timeout_minutes)
            .fold(Some(i64::MAX), |acc, v| match (acc, v) {
                (Some(acc), Some(v)) => Some(acc.min(v)),
                _ => None,
            });
    }

    fn recompute_compatibility(&mut self) {
        for server in self.servers.values() {
            if server.server_type == ServerType::Unknown {
                continue;
            }
            if server.min_wire_version > CLIENT_MAX_WIRE_VERSION {
                self.compatible = false;
                self.compatibility_error = Some(format!(
                    "server at {} requires wire version {} but this client supports up to {}; \
                     please upgrade this client",
                    server.address, server.min_wire_version, CLIENT_MAX_WIRE_VERSION
                ));
                return;
            }
            if server.max_wire_version < CLIENT_MIN_WIRE_VERSION {
                self.compatible = false;
                self.compatibility_error = Some(format!(
                    "server at {} only supports wire version up to {} but this client requires \
                     at least {}; please upgrade the server",
                    server.address, server.max_wire_version, CLIENT_MIN_WIRE_VERSION
                ));
                return;
            }
        }
        self.compatible = true;
        self.compatibility_error = None;
    }

    /// Implements the pure `apply(current, incoming) -> TopologyDescription` transition of §4.6.
    /// Takes `self` by value because the topology's serialized applier task (§5) always replaces
    /// its stored snapshot wholesale rather than mutating in place.
    pub fn apply(mut self, incoming: ServerDescription) -> Self {
        if self.kind == TopologyType::LoadBalanced {
            // Fixed; no monitoring beyond the initial handshake per host (§4.6).
            return self;
        }
        if !self.servers.contains_key(&incoming.address) {
            // The server was removed from the topology (e.g. by a primary's host list update)
            // before this report arrived; drop it.
            return self;
        }

        match self.kind {
            TopologyType::Single => {
                self.servers.insert(incoming.address.clone(), incoming);
            }
            TopologyType::Unknown => {
                self.apply_unknown_topology(incoming);
            }
            TopologyType::Sharded => {
                self.apply_sharded(incoming);
            }
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
                self.apply_replica_set(incoming);
            }
            TopologyType::LoadBalanced => unreachable!("handled above"),
        }

        self.recompute_compatibility();
        self.recompute_session_timeout();
        self
    }

    fn apply_unknown_topology(&mut self, incoming: ServerDescription) {
        match incoming.server_type {
            ServerType::Unknown => {
                self.servers.insert(incoming.address.clone(), incoming);
            }
            ServerType::Standalone => {
                if self.servers.len() == 1 {
                    self.kind = TopologyType::Single;
                }
                self.servers.insert(incoming.address.clone(), incoming);
            }
            ServerType::Mongos => {
                self.kind = TopologyType::Sharded;
                self.servers.insert(incoming.address.clone(), incoming);
            }
            ServerType::RSPrimary | ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                self.kind = TopologyType::ReplicaSetNoPrimary;
                self.set_name = incoming.set_name.clone();
                self.apply_replica_set(incoming);
            }
            ServerType::RSGhost | ServerType::LoadBalancer => {
                self.servers.insert(incoming.address.clone(), incoming);
            }
        }
    }

    fn apply_sharded(&mut self, incoming: ServerDescription) {
        match incoming.server_type {
            ServerType::Unknown | ServerType::Mongos => {
                self.servers.insert(incoming.address.clone(), incoming);
            }
            _ => {
                // A non-mongos, non-unknown report inside a Sharded topology is removed (§4.6).
                self.servers.remove(&incoming.address);
            }
        }
    }

    fn apply_replica_set(&mut self, incoming: ServerDescription) {
        match incoming.server_type {
            ServerType::RSPrimary => self.apply_rs_primary(incoming),
            ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                self.apply_rs_secondary_like(incoming)
            }
            ServerType::RSGhost => {
                self.servers.insert(incoming.address.clone(), incoming);
                self.update_kind_from_members();
            }
            _ => {
                self.servers.insert(incoming.address.clone(), incoming);
                self.update_kind_from_members();
            }
        }
    }

    fn apply_rs_primary(&mut self, incoming: ServerDescription) {
        if let Some(set_name) = &self.set_name {
            if incoming.set_name.as_deref() != Some(set_name.as_str()) {
                // Wrong set name: treat the reporting server as removed (never this server's
                // primary) and leave the rest of the topology untouched.
                self.servers.remove(&incoming.address);
                self.update_kind_from_members();
                return;
            }
        } else {
            self.set_name = incoming.set_name.clone();
        }

        if self.is_stale_primary(&incoming) {
            // Stale primary report: demote to Unknown without touching the rest of the topology.
            let stale = ServerDescription::unknown(incoming.address.clone());
            self.servers.insert(incoming.address, stale);
            self.update_kind_from_members();
            return;
        }

        self.max_set_version = incoming.set_version.or(self.max_set_version);
        self.max_election_id = incoming.election_id.or(self.max_election_id);

        let primary_address = incoming.address.clone();
        let reported_hosts: Vec<ServerAddress> = incoming.reported_hosts().cloned().collect();

        // Any other server this primary doesn't recognize, or that disagrees about `me`, is
        // removed from the topology (§4.6).
        self.servers
            .retain(|addr, desc| addr == &primary_address || desc.server_type == ServerType::Unknown || reported_hosts.contains(addr));

        // Demote any other server currently marked as primary; only one primary can stand.
        for desc in self.servers.values_mut() {
            if desc.address != primary_address && desc.server_type == ServerType::RSPrimary {
                *desc = ServerDescription::unknown(desc.address.clone());
            }
        }

        for host in &reported_hosts {
            self.servers
                .entry(host.clone())
                .or_insert_with(|| ServerDescription::unknown(host.clone()));
        }

        self.servers.insert(primary_address, incoming);
        self.update_kind_from_members();
    }

    /// A primary report is stale if its `(setVersion, electionId)` pair is not newer than the
    /// topology's recorded maximum (§4.6, boundary scenario 2).
    fn is_stale_primary(&self, incoming: &ServerDescription) -> bool {
        match (self.max_election_id, incoming.election_id) {
            (Some(max), Some(new)) if new < max => return true,
            (Some(max), Some(new)) if new == max => {
                if let (Some(max_v), Some(new_v)) = (self.max_set_version, incoming.set_version) {
                    if new_v < max_v {
                        return true;
                    }
                }
            }
            _ => {}
        }
        false
    }

    fn apply_rs_secondary_like(&mut self, incoming: ServerDescription) {
        if let Some(set_name) = &self.set_name {
            if incoming.set_name.as_deref() != Some(set_name.as_str()) {
                self.servers.remove(&incoming.address);
                self.update_kind_from_members();
                return;
            }
        } else {
            self.set_name = incoming.set_name.clone();
        }

        if let Some(me) = &incoming.me {
            if me != &incoming.address {
                self.servers.remove(&incoming.address);
                self.update_kind_from_members();
                return;
            }
        }

        for host in incoming.reported_hosts().cloned().collect::<Vec<_>>() {
            self.servers
                .entry(host.clone())
                .or_insert_with(|| ServerDescription::unknown(host));
        }

        self.servers.insert(incoming.address.clone(), incoming);
        self.update_kind_from_members();
    }

    fn update_kind_from_members(&mut self) {
        if self.kind == TopologyType::Single || self.kind == TopologyType::LoadBalanced {
            return;
        }
        let has_primary = self
            .servers
            .values()
            .any(|s| s.server_type == ServerType::RSPrimary);
        self.kind = if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    pub(crate) fn selectable_servers(&self) -> Vec<ServerDescription> {
        self.servers
            .values()
            .filter(|s| s.server_type != ServerType::Unknown)
            .cloned()
            .collect()
    }

    pub(crate) fn compatibility_error(&self) -> Option<ErrorKind> {
        if self.compatible {
            None
        } else {
            Some(ErrorKind::ServerSelection {
                message: self
                    .compatibility_error
                    .clone()
                    .unwrap_or_else(|| "incompatible server wire version".into()),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(host: &str) -> ServerAddress {
        ServerAddress::Tcp { host: host.into(), port: 27017 }
    }

    fn options(hosts: &[&str], set_name: Option<&str>) -> ClientOptions {
        let hosts = hosts.iter().map(|h| addr(h)).collect();
        let mut builder = ClientOptions::builder().hosts(hosts);
        if let Some(name) = set_name {
            builder = builder.repl_set_name(Some(name.to_string()));
        }
        builder.build()
    }

    fn rs_primary(address: ServerAddress, set_name: &str, hosts: Vec<ServerAddress>, set_version: i32, election: i32) -> ServerDescription {
        let mut d = ServerDescription::unknown(address);
        d.server_type = ServerType::RSPrimary;
        d.set_name = Some(set_name.to_string());
        d.hosts = hosts;
        d.set_version = Some(set_version);
        d.election_id = Some(oid_from_counter(election));
        d.min_wire_version = 0;
        d.max_wire_version = 17;
        d
    }

    fn oid_from_counter(n: i32) -> ObjectId {
        let mut bytes = [0u8; 12];
        bytes[8..12].copy_from_slice(&n.to_be_bytes());
        ObjectId::from_bytes(bytes)
    }

    #[test]
    fn primary_discovery_transitions_to_replica_set_with_primary() {
        let opts = options(&["a:27017", "b:27017"], Some("rs"));
        let topology = TopologyDescription::new(&opts);
        assert_eq!(topology.kind, TopologyType::ReplicaSetNoPrimary);

        let hosts = vec![addr("a:27017"), addr("b:27017"), addr("c:27017")];
        let primary = rs_primary(addr("a:27017"), "rs", hosts, 1, 5);
        let topology = topology.apply(primary);

        assert_eq!(topology.kind, TopologyType::ReplicaSetWithPrimary);
        assert!(topology.servers.contains_key(&addr("c:27017")));
        assert_eq!(topology.max_election_id, Some(oid_from_counter(5)));
    }

    #[test]
    fn stale_primary_report_is_ignored() {
        let opts = options(&["a:27017", "b:27017"], Some("rs"));
        let topology = TopologyDescription::new(&opts);
        let hosts = vec![addr("a:27017"), addr("b:27017")];
        let topology = topology.apply(rs_primary(addr("a:27017"), "rs", hosts.clone(), 1, 5));
        assert_eq!(topology.max_election_id, Some(oid_from_counter(5)));

        // Older election id: should be ignored, server goes Unknown, maxElectionId unchanged.
        let stale = rs_primary(addr("a:27017"), "rs", hosts, 1, 4);
        let topology = topology.apply(stale);
        assert_eq!(topology.max_election_id, Some(oid_from_counter(5)));
        assert_eq!(topology.servers[&addr("a:27017")].server_type, ServerType::Unknown);
    }

    #[test]
    fn incompatible_wire_version_marks_topology_incompatible() {
        let opts = options(&["a:27017"], None);
        let topology = TopologyDescription::new(&opts);
        let mut desc = ServerDescription::unknown(addr("a:27017"));
        desc.server_type = ServerType::Standalone;
        desc.min_wire_version = CLIENT_MAX_WIRE_VERSION + 1;
        desc.max_wire_version = CLIENT_MAX_WIRE_VERSION + 10;
        let topology = topology.apply(desc);
        assert!(!topology.compatible);
    }

    #[test]
    fn single_seed_without_replica_set_name_is_single_topology() {
        let opts = options(&["a:27017"], None);
        let topology = TopologyDescription::new(&opts);
        assert_eq!(topology.kind, TopologyType::Single);
    }
}
