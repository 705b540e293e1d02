//! Connection-pool and connection lifecycle events (§4.2, §4.3, §5).

use std::time::Duration;

use crate::options::ServerAddress;

#[derive(Clone, Debug)]
pub enum CmapEvent {
    PoolCreated { address: ServerAddress },
    PoolReady { address: ServerAddress },
    PoolCleared { address: ServerAddress, cause: String },
    PoolClosed { address: ServerAddress },
    ConnectionCreated { address: ServerAddress, connection_id: u32 },
    ConnectionReady { address: ServerAddress, connection_id: u32, duration: Duration },
    ConnectionClosed { address: ServerAddress, connection_id: u32, reason: ConnectionClosedReason },
    ConnectionCheckOutStarted { address: ServerAddress },
    ConnectionCheckedOut { address: ServerAddress, connection_id: u32, duration: Duration },
    ConnectionCheckOutFailed { address: ServerAddress, reason: CheckOutFailedReason },
    ConnectionCheckedIn { address: ServerAddress, connection_id: u32 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionClosedReason {
    Stale,
    Idle,
    Error,
    PoolClosed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckOutFailedReason {
    Timeout,
    ConnectionError,
    PoolClosed,
}

/// A caller-supplied sink for [`CmapEvent`]s, matching the teacher's `CmapEventHandler` trait
/// shape. Every method has a default no-op body so implementors only override what they need.
pub trait CmapEventHandler: Send + Sync {
    fn handle_pool_created_event(&self, _event: CmapEvent) {}
    fn handle_pool_ready_event(&self, _event: CmapEvent) {}
    fn handle_pool_cleared_event(&self, _event: CmapEvent) {}
    fn handle_pool_closed_event(&self, _event: CmapEvent) {}
    fn handle_connection_created_event(&self, _event: CmapEvent) {}
    fn handle_connection_ready_event(&self, _event: CmapEvent) {}
    fn handle_connection_closed_event(&self, _event: CmapEvent) {}
    fn handle_connection_checkout_started_event(&self, _event: CmapEvent) {}
    fn handle_connection_checked_out_event(&self, _event: CmapEvent) {}
    fn handle_connection_checkout_failed_event(&self, _event: CmapEvent) {}
    fn handle_connection_checked_in_event(&self, _event: CmapEvent) {}
}

/// Forwards every event to each handler in order. Used to attach the tracing sink alongside
/// whatever handler a caller supplied, without `Topology`/`ConnectionPool` needing to know about
/// more than one handler slot.
pub(crate) struct ChainedCmapEventHandler(Vec<std::sync::Arc<dyn CmapEventHandler>>);

impl CmapEventHandler for ChainedCmapEventHandler {
    fn handle_pool_created_event(&self, event: CmapEvent) {
        for h in &self.0 {
            h.handle_pool_created_event(event.clone());
        }
    }
    fn handle_pool_ready_event(&self, event: CmapEvent) {
        for h in &self.0 {
            h.handle_pool_ready_event(event.clone());
        }
    }
    fn handle_pool_cleared_event(&self, event: CmapEvent) {
        for h in &self.0 {
            h.handle_pool_cleared_event(event.clone());
        }
    }
    fn handle_pool_closed_event(&self, event: CmapEvent) {
        for h in &self.0 {
            h.handle_pool_closed_event(event.clone());
        }
    }
    fn handle_connection_created_event(&self, event: CmapEvent) {
        for h in &self.0 {
            h.handle_connection_created_event(event.clone());
        }
    }
    fn handle_connection_ready_event(&self, event: CmapEvent) {
        for h in &self.0 {
            h.handle_connection_ready_event(event.clone());
        }
    }
    fn handle_connection_closed_event(&self, event: CmapEvent) {
        for h in &self.0 {
            h.handle_connection_closed_event(event.clone());
        }
    }
    fn handle_connection_checkout_started_event(&self, event: CmapEvent) {
        for h in &self.0 {
            h.handle_connection_checkout_started_event(event.clone());
        }
    }
    fn handle_connection_checked_out_event(&self, event: CmapEvent) {
        for h in &self.0 {
            h.handle_connection_checked_out_event(event.clone());
        }
    }
    fn handle_connection_checkout_failed_event(&self, event: CmapEvent) {
        for h in &self.0 {
            h.handle_connection_checkout_failed_event(event.clone());
        }
    }
    fn handle_connection_checked_in_event(&self, event: CmapEvent) {
        for h in &self.0 {
            h.handle_connection_checked_in_event(event.clone());
        }
    }
}

/// Emits every [`CmapEvent`] as a `tracing` event at the `mongodb::cmap` target. Only compiled in
/// with the `tracing-unstable` feature, matching the teacher's opt-in tracing surface.
#[cfg(feature = "tracing-unstable")]
pub(crate) struct TracingCmapEventHandler;

#[cfg(feature = "tracing-unstable")]
impl CmapEventHandler for TracingCmapEventHandler {
    fn handle_pool_created_event(&self, event: CmapEvent) {
        tracing::debug!(target: "mongodb::cmap", ?event);
    }
    fn handle_pool_ready_event(&self, event: CmapEvent) {
        tracing::debug!(target: "mongodb::cmap", ?event);
    }
    fn handle_pool_cleared_event(&self, event: CmapEvent) {
        tracing::debug!(target: "mongodb::cmap", ?event);
    }
    fn handle_pool_closed_event(&self, event: CmapEvent) {
        tracing::debug!(target: "mongodb::cmap", ?event);
    }
    fn handle_connection_created_event(&self, event: CmapEvent) {
        tracing::debug!(target: "mongodb::cmap", ?event);
    }
    fn handle_connection_ready_event(&self, event: CmapEvent) {
        tracing::debug!(target: "mongodb::cmap", ?event);
    }
    fn handle_connection_closed_event(&self, event: CmapEvent) {
        tracing::debug!(target: "mongodb::cmap", ?event);
    }
    fn handle_connection_checkout_started_event(&self, event: CmapEvent) {
        tracing::debug!(target: "mongodb::cmap", ?event);
    }
    fn handle_connection_checked_out_event(&self, event: CmapEvent) {
        tracing::debug!(target: "mongodb::cmap", ?event);
    }
    fn handle_connection_checkout_failed_event(&self, event: CmapEvent) {
        tracing::debug!(target: "mongodb::cmap", ?event);
    }
    fn handle_connection_checked_in_event(&self, event: CmapEvent) {
        tracing::debug!(target: "mongodb::cmap", ?event);
    }
}

/// Attaches the tracing sink (when `tracing-unstable` is enabled) alongside whatever handler the
/// caller supplied, collapsing both into the single handler slot `ConnectionPool` stores.
pub(crate) fn with_tracing(
    handler: Option<std::sync::Arc<dyn CmapEventHandler>>,
) -> Option<std::sync::Arc<dyn CmapEventHandler>> {
    #[cfg(feature = "tracing-unstable")]
    {
        let mut handlers: Vec<std::sync::Arc<dyn CmapEventHandler>> = Vec::new();
        if let Some(h) = handler {
            handlers.push(h);
        }
        handlers.push(std::sync::Arc::new(TracingCmapEventHandler));
        Some(std::sync::Arc::new(ChainedCmapEventHandler(handlers)))
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

    impl CmapEventHandler for CountingHandler {
        fn handle_pool_created_event(&self, _event: CmapEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn handle_connection_checked_in_event(&self, _event: CmapEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn chained_handler_forwards_to_every_inner_handler() {
        let first = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let second = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let chained = ChainedCmapEventHandler(vec![first.clone(), second.clone()]);

        let address = ServerAddress::parse("localhost:27017").unwrap();
        chained.handle_pool_created_event(CmapEvent::PoolCreated { address: address.clone() });
        chained.handle_connection_checked_in_event(CmapEvent::ConnectionCheckedIn {
            address,
            connection_id: 1,
        });

        assert_eq!(first.0.load(Ordering::SeqCst), 2);
        assert_eq!(second.0.load(Ordering::SeqCst), 2);
    }
}
