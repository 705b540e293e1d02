//! [`ServerDescription`] and [`ServerType`] (§3).

use std::{collections::HashMap, time::Duration};

use bson::oid::ObjectId;

use crate::{error::Error, options::ServerAddress, sdam::cluster_time::ClusterTime};

/// The kind of server a `hello`/`isMaster` reply described it as (§3 ServerKind).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ServerType {
    Unknown,
    Standalone,
    RSPrimary,
    RSSecondary,
    RSArbiter,
    RSOther,
    RSGhost,
    Mongos,
    LoadBalancer,
}

impl ServerType {
    /// Whether this server type can serve queries directly, used by `sessionTimeoutMinutes`
    /// aggregation (§4.6) and by write selection.
    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::RSPrimary | ServerType::RSSecondary | ServerType::Mongos | ServerType::Standalone
        )
    }

    pub fn is_replica_set_member(self) -> bool {
        matches!(
            self,
            ServerType::RSPrimary
                | ServerType::RSSecondary
                | ServerType::RSArbiter
                | ServerType::RSOther
                | ServerType::RSGhost
        )
    }
}

/// `{processId, counter}` from a `hello` reply, used to detect a server restart mid-exhaust
/// stream (§3).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TopologyVersion {
    pub process_id: ObjectId,
    pub counter: i64,
}

/// An immutable snapshot of one server's last-known state, re-published on every heartbeat
/// (§3 ServerDescription, §4.5).
#[derive(Clone, Debug)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub server_type: ServerType,
    pub tags: HashMap<String, String>,
    pub average_rtt: Option<Duration>,
    pub last_update_time: Option<std::time::Instant>,

    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ObjectId>,
    pub primary: Option<ServerAddress>,
    pub hosts: Vec<ServerAddress>,
    pub passives: Vec<ServerAddress>,
    pub arbiters: Vec<ServerAddress>,
    pub me: Option<ServerAddress>,

    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub max_bson_object_size: i64,
    pub max_message_size_bytes: i64,
    pub max_write_batch_size: i64,

    pub hello_ok: bool,
    pub sasl_supported_mechs: Vec<String>,
    pub compression: Vec<String>,
    pub topology_version: Option<TopologyVersion>,
    pub logical_session_timeout_minutes: Option<i64>,

    pub last_error: Option<Error>,
}

impl ServerDescription {
    /// The initial description every newly-discovered address starts with, before its first
    /// heartbeat completes.
    pub fn unknown(address: ServerAddress) -> Self {
        ServerDescription {
            address,
            server_type: ServerType::Unknown,
            tags: HashMap::new(),
            average_rtt: None,
            last_update_time: None,
            set_name: None,
            set_version: None,
            election_id: None,
            primary: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            me: None,
            min_wire_version: 0,
            max_wire_version: 0,
            max_bson_object_size: 16 * 1024 * 1024,
            max_message_size_bytes: 48 * 1024 * 1024,
            max_write_batch_size: 100_000,
            hello_ok: false,
            sasl_supported_mechs: Vec::new(),
            compression: Vec::new(),
            topology_version: None,
            logical_session_timeout_minutes: None,
            last_error: None,
        }
    }

    pub fn with_error(address: ServerAddress, error: Error) -> Self {
        ServerDescription {
            last_error: Some(error),
            ..ServerDescription::unknown(address)
        }
    }

    /// Updates the EWMA average RTT per §4.5: `avg ← 0.2·sample + 0.8·avg`.
    pub fn update_rtt(&mut self, sample: Duration) {
        self.average_rtt = Some(match self.average_rtt {
            None => sample,
            Some(avg) => {
                let avg_ms = avg.as_secs_f64() * 1000.0;
                let sample_ms = sample.as_secs_f64() * 1000.0;
                let new_ms = 0.2 * sample_ms + 0.8 * avg_ms;
                Duration::from_secs_f64((new_ms / 1000.0).max(0.0))
            }
        });
    }

    /// `minWireVersion ≤ maxWireVersion`, the per-description invariant from §3 and §8.
    pub fn is_wire_version_valid(&self) -> bool {
        self.min_wire_version <= self.max_wire_version
    }

    /// All hosts this server's `hello` reply claims belong to the replica set: `hosts ∪ passives
    /// ∪ arbiters`, per §4.6's host-union rule.
    pub fn reported_hosts(&self) -> impl Iterator<Item = &ServerAddress> {
        self.hosts.iter().chain(self.passives.iter()).chain(self.arbiters.iter())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr() -> ServerAddress {
        ServerAddress::Tcp { host: "h".into(), port: 27017 }
    }

    #[test]
    fn ewma_converges_toward_samples() {
        let mut desc = ServerDescription::unknown(addr());
        desc.update_rtt(Duration::from_millis(100));
        assert_eq!(desc.average_rtt, Some(Duration::from_millis(100)));
        desc.update_rtt(Duration::from_millis(0));
        // 0.2*0 + 0.8*100 = 80ms
        assert_eq!(desc.average_rtt, Some(Duration::from_millis(80)));
    }

    #[test]
    fn unknown_description_is_wire_version_valid_by_default() {
        assert!(ServerDescription::unknown(addr()).is_wire_version_valid());
    }
}
