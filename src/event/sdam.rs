//! Topology and server monitoring events (§4.5, §4.6).

use crate::{
    options::ServerAddress,
    sdam::description::{ServerDescription, TopologyDescription},
};

#[derive(Clone, Debug)]
pub enum SdamEvent {
    ServerDescriptionChanged {
        address: ServerAddress,
        previous: Box<ServerDescription>,
        new: Box<ServerDescription>,
    },
    ServerOpening {
        address: ServerAddress,
    },
    ServerClosed {
        address: ServerAddress,
    },
    TopologyDescriptionChanged {
        previous: Box<TopologyDescription>,
        new: Box<TopologyDescription>,
    },
    TopologyOpening,
    TopologyClosed,
    ServerHeartbeatStarted {
        address: ServerAddress,
    },
    ServerHeartbeatSucceeded {
        address: ServerAddress,
        duration: std::time::Duration,
    },
    ServerHeartbeatFailed {
        address: ServerAddress,
        duration: std::time::Duration,
        message: String,
    },
}

/// A caller-supplied sink for [`SdamEvent`]s, matching the teacher's `SdamEventHandler` trait
/// shape.
pub trait SdamEventHandler: Send + Sync {
    fn handle_server_description_changed_event(&self, _event: SdamEvent) {}
    fn handle_server_opening_event(&self, _event: SdamEvent) {}
    fn handle_server_closed_event(&self, _event: SdamEvent) {}
    fn handle_topology_description_changed_event(&self, _event: SdamEvent) {}
    fn handle_topology_opening_event(&self, _event: SdamEvent) {}
    fn handle_topology_closed_event(&self, _event: SdamEvent) {}
    fn handle_server_heartbeat_started_event(&self, _event: SdamEvent) {}
    fn handle_server_heartbeat_succeeded_event(&self, _event: SdamEvent) {}
    fn handle_server_heartbeat_failed_event(&self, _event: SdamEvent) {}
}

/// Forwards every event to each handler in order, the SDAM-side counterpart of
/// `cmap::ChainedCmapEventHandler`.
pub(crate) struct ChainedSdamEventHandler(Vec<std::sync::Arc<dyn SdamEventHandler>>);

impl SdamEventHandler for ChainedSdamEventHandler {
    fn handle_server_description_changed_event(&self, event: SdamEvent) {
        for h in &self.0 {
            h.handle_server_description_changed_event(event.clone());
        }
    }
    fn handle_server_opening_event(&self, event: SdamEvent) {
        for h in &self.0 {
            h.handle_server_opening_event(event.clone());
        }
    }
    fn handle_server_closed_event(&self, event: SdamEvent) {
        for h in &self.0 {
            h.handle_server_closed_event(event.clone());
        }
    }
    fn handle_topology_description_changed_event(&self, event: SdamEvent) {
        for h in &self.0 {
            h.handle_topology_description_changed_event(event.clone());
        }
    }
    fn handle_topology_opening_event(&self, event: SdamEvent) {
        for h in &self.0 {
            h.handle_topology_opening_event(event.clone());
        }
    }
    fn handle_topology_closed_event(&self, event: SdamEvent) {
        for h in &self.0 {
            h.handle_topology_closed_event(event.clone());
        }
    }
    fn handle_server_heartbeat_started_event(&self, event: SdamEvent) {
        for h in &self.0 {
            h.handle_server_heartbeat_started_event(event.clone());
        }
    }
    fn handle_server_heartbeat_succeeded_event(&self, event: SdamEvent) {
        for h in &self.0 {
            h.handle_server_heartbeat_succeeded_event(event.clone());
        }
    }
    fn handle_server_heartbeat_failed_event(&self, event: SdamEvent) {
        for h in &self.0 {
            h.handle_server_heartbeat_failed_event(event.clone());
        }
    }
}

/// Emits every [`SdamEvent`] as a `tracing` event at the `mongodb::sdam` target.
#[cfg(feature = "tracing-unstable")]
pub(crate) struct TracingSdamEventHandler;

#[cfg(feature = "tracing-unstable")]
impl SdamEventHandler for TracingSdamEventHandler {
    fn handle_server_description_changed_event(&self, event: SdamEvent) {
        tracing::debug!(target: "mongodb::sdam", ?event);
    }
    fn handle_server_opening_event(&self, event: SdamEvent) {
        tracing::debug!(target: "mongodb::sdam", ?event);
    }
    fn handle_server_closed_event(&self, event: SdamEvent) {
        tracing::debug!(target: "mongodb::sdam", ?event);
    }
    fn handle_topology_description_changed_event(&self, event: SdamEvent) {
        tracing::debug!(target: "mongodb::sdam", ?event);
    }
    fn handle_topology_opening_event(&self, event: SdamEvent) {
        tracing::debug!(target: "mongodb::sdam", ?event);
    }
    fn handle_topology_closed_event(&self, event: SdamEvent) {
        tracing::debug!(target: "mongodb::sdam", ?event);
    }
    fn handle_server_heartbeat_started_event(&self, event: SdamEvent) {
        tracing::debug!(target: "mongodb::sdam", ?event);
    }
    fn handle_server_heartbeat_succeeded_event(&self, event: SdamEvent) {
        tracing::debug!(target: "mongodb::sdam", ?event);
    }
    fn handle_server_heartbeat_failed_event(&self, event: SdamEvent) {
        tracing::debug!(target: "mongodb::sdam", ?event);
    }
}

/// Attaches the tracing sink (when `tracing-unstable` is enabled) alongside whatever handler the
/// caller supplied, collapsing both into the single handler slot `Topology` stores.
pub(crate) fn with_tracing(
    handler: Option<std::sync::Arc<dyn SdamEventHandler>>,
) -> Option<std::sync::Arc<dyn SdamEventHandler>> {
    #[cfg(feature = "tracing-unstable")]
    {
        let mut handlers: Vec<std::sync::Arc<dyn SdamEventHandler>> = Vec::new();
        if let Some(h) = handler {
            handlers.push(h);
        }
        handlers.push(std::sync::Arc::new(TracingSdamEventHandler));
        Some(std::sync::Arc::new(ChainedSdamEventHandler(handlers)))
    }
    #[cfg(not(feature = "tracing-unstable"))]
    {
        handler
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    struct CountingHandler(AtomicUsize);

    impl SdamEventHandler for CountingHandler {
        fn handle_topology_opening_event(&self, _event: SdamEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn handle_server_opening_event(&self, _event: SdamEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn chained_handler_forwards_to_every_inner_handler() {
        let first = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let second = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let chained = ChainedSdamEventHandler(vec![first.clone(), second.clone()]);

        chained.handle_topology_opening_event(SdamEvent::TopologyOpening);
        chained.handle_server_opening_event(SdamEvent::ServerOpening {
            address: ServerAddress::parse("localhost:27017").unwrap(),
        });

        assert_eq!(first.0.load(Ordering::SeqCst), 2);
        assert_eq!(second.0.load(Ordering::SeqCst), 2);
    }
}
