//! The data model of §3: per-server and per-topology immutable snapshots.

mod server;
mod topology;

pub use server::{ServerDescription, ServerType, TopologyVersion};
pub use topology::{TopologyDescription, TopologyType, CLIENT_MAX_WIRE_VERSION, CLIENT_MIN_WIRE_VERSION};
