//! The per-address connection pool (§3 Pool, §4.3).

pub(crate) mod conn;
mod establish;
mod status;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use tokio::sync::{Mutex, Semaphore};

/// How often the background maintenance task wakes up to reap stale connections and top up
/// `minPoolSize`. Chosen to match the teacher's background-thread cadence.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(100);

pub use conn::Connection;
pub(crate) use establish::{HandshakeProtocol, Handshaker, MIN_HEARTBEAT_INTERVAL};

use self::status::PoolState;
use crate::{
    error::{Error, ErrorKind, PoolError, Result},
    event::cmap::{CheckOutFailedReason, CmapEvent, CmapEventHandler, ConnectionClosedReason},
    options::{ClientOptions, Credential, ServerAddress},
    sdam::description::ServerDescription,
};

struct PoolInner {
    idle: Vec<Connection>,
    generation: u64,
    state: PoolState,
}

/// A bounded pool of connections to one address. `checkout`/`checkin` are the only suspension
/// points; `checkin` never suspends (§5).
pub(crate) struct ConnectionPool {
    pub(crate) address: ServerAddress,
    options: Arc<ClientOptions>,
    handshaker: Arc<Handshaker>,
    credential: Option<Credential>,
    semaphore: Arc<Semaphore>,
    inner: Mutex<PoolInner>,
    next_id: AtomicU64,
    event_handler: Option<Arc<dyn CmapEventHandler>>,
    max: usize,
    min_pool_size: usize,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        options: Arc<ClientOptions>,
        handshaker: Arc<Handshaker>,
        credential: Option<Credential>,
        event_handler: Option<Arc<dyn CmapEventHandler>>,
    ) -> Self {
        let max = options.max_pool_size.max(1) as usize;
        let min_pool_size = (options.min_pool_size as usize).min(max);
        if let Some(handler) = &event_handler {
            handler.handle_pool_created_event(CmapEvent::PoolCreated { address: address.clone() });
        }
        ConnectionPool {
            address,
            options,
            handshaker,
            credential,
            semaphore: Arc::new(Semaphore::new(max)),
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                generation: 0,
                state: PoolState::Paused,
            }),
            next_id: AtomicU64::new(1),
            event_handler,
            max,
            min_pool_size,
        }
    }

    /// Spawns the background task that reaps idle/stale connections and tops the pool up to
    /// `minPoolSize` (§3 Pool, §4.3). Grounded on the teacher's `cmap/background.rs`
    /// `start_background_thread`/`perform_checks`: a weak reference so the task exits once the
    /// pool itself is dropped, reap-then-top-up ordering so reaping never dips the pool under
    /// `minPoolSize` within one tick.
    pub(crate) fn spawn_background_maintenance(pool: &Arc<Self>) {
        let weak = Arc::downgrade(pool);
        tokio::spawn(async move { run_maintenance_loop(weak).await });
    }

    /// Removes idle connections that are stale (generation mismatch) or past their idle deadline,
    /// releasing the slot each one held back to the semaphore.
    async fn reap_perished(&self) {
        let mut inner = self.inner.lock().await;
        let generation = inner.generation;
        let (keep, perished): (Vec<_>, Vec<_>) =
            std::mem::take(&mut inner.idle).into_iter().partition(|c| c.generation == generation && !c.expired());
        inner.idle = keep;
        drop(inner);
        for mut conn in perished {
            if let Some(handler) = &self.event_handler {
                handler.handle_connection_closed_event(CmapEvent::ConnectionClosed {
                    address: self.address.clone(),
                    connection_id: conn.id as u32,
                    reason: ConnectionClosedReason::Stale,
                });
            }
            conn.close().await;
            self.semaphore.add_permits(1);
        }
    }

    /// Creates and handshakes connections until the pool holds at least `minPoolSize`, stopping
    /// early (rather than blocking the maintenance loop) if no permit is immediately available —
    /// i.e. the pool is already at `maxPoolSize` worth of idle+in-use connections.
    async fn top_up_to_min_pool_size(&self) {
        if self.min_pool_size == 0 {
            return;
        }
        loop {
            let generation = {
                let inner = self.inner.lock().await;
                if inner.state == PoolState::Closed {
                    return;
                }
                if self.max - self.semaphore.available_permits() >= self.min_pool_size {
                    return;
                }
                inner.generation
            };
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let mut conn = match Connection::open(id, self.address.clone(), generation, &self.options).await {
                Ok(conn) => conn,
                Err(_) => {
                    drop(permit);
                    return;
                }
            };
            if let Some(handler) = &self.event_handler {
                handler.handle_connection_created_event(CmapEvent::ConnectionCreated {
                    address: self.address.clone(),
                    connection_id: id as u32,
                });
            }
            if self
                .handshaker
                .handshake(&mut conn, &self.options, HandshakeProtocol::Hello, self.credential.as_ref())
                .await
                .is_err()
            {
                drop(permit);
                conn.close().await;
                return;
            }
            permit.forget();
            if let Some(handler) = &self.event_handler {
                handler.handle_connection_ready_event(CmapEvent::ConnectionReady {
                    address: self.address.clone(),
                    connection_id: id as u32,
                    duration: Duration::from_secs(0),
                });
            }
            let mut inner = self.inner.lock().await;
            if inner.generation != generation || inner.state == PoolState::Closed {
                drop(inner);
                self.semaphore.add_permits(1);
                conn.close().await;
                return;
            }
            inner.idle.push(conn);
        }
    }

    pub(crate) async fn mark_ready(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == PoolState::Paused {
            inner.state = PoolState::Ready;
            if let Some(handler) = &self.event_handler {
                handler.handle_pool_ready_event(CmapEvent::PoolReady { address: self.address.clone() });
            }
        }
    }

    /// Checks out a ready, unexpired connection: reuses an idle one if available, otherwise dials
    /// and handshakes a new one as long as the pool has not reached `maxPoolSize`. Enforces the
    /// deadline by bounding how long this call will wait for a semaphore permit, which is the
    /// FIFO waiter queue (§4.3).
    ///
    /// The semaphore tracks total live connections, not just checked-out ones: every connection,
    /// idle or in use, holds one forgotten permit from the moment it is created until the moment
    /// it is destroyed. Reusing an idle connection therefore needs no permit at all — the permit
    /// was already spent when that connection was first created — only creating a brand new one
    /// does. This is what keeps `|idle| + |inUse| ≤ max` true at every instant (§8).
    pub(crate) async fn checkout(&self, deadline: Option<Instant>) -> Result<Connection> {
        if let Some(handler) = &self.event_handler {
            handler.handle_connection_checkout_started_event(CmapEvent::ConnectionCheckOutStarted {
                address: self.address.clone(),
            });
        }

        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.state == PoolState::Closed {
                    self.emit_checkout_failed(CheckOutFailedReason::PoolClosed);
                    return Err(PoolError::Closed { address: self.address.clone() }.into());
                }
                if let Some(mut conn) = inner.idle.pop() {
                    if conn.expired() {
                        drop(inner);
                        if let Some(handler) = &self.event_handler {
                            handler.handle_connection_closed_event(CmapEvent::ConnectionClosed {
                                address: self.address.clone(),
                                connection_id: conn.id as u32,
                                reason: ConnectionClosedReason::Stale,
                            });
                        }
                        conn.close().await;
                        self.semaphore.add_permits(1);
                        continue;
                    }
                    if let Some(handler) = &self.event_handler {
                        handler.handle_connection_checked_out_event(CmapEvent::ConnectionCheckedOut {
                            address: self.address.clone(),
                            connection_id: conn.id as u32,
                            duration: Duration::from_secs(0),
                        });
                    }
                    return Ok(conn);
                }
            }

            // Idle was empty: a new connection is needed, gated by a fresh permit.
            let permit = match self.acquire_permit(deadline).await {
                Ok(permit) => permit,
                Err(e) => {
                    self.emit_checkout_failed(CheckOutFailedReason::Timeout);
                    return Err(e);
                }
            };
            let generation = self.inner.lock().await.generation;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let start = Instant::now();
            let mut conn = match Connection::open(id, self.address.clone(), generation, &self.options).await {
                Ok(conn) => conn,
                Err(e) => {
                    drop(permit);
                    self.emit_checkout_failed(CheckOutFailedReason::ConnectionError);
                    return Err(e);
                }
            };
            if let Some(handler) = &self.event_handler {
                handler.handle_connection_created_event(CmapEvent::ConnectionCreated {
                    address: self.address.clone(),
                    connection_id: id as u32,
                });
            }
            if let Err(e) = self
                .handshaker
                .handshake(&mut conn, &self.options, HandshakeProtocol::Hello, self.credential.as_ref())
                .await
            {
                drop(permit);
                conn.close().await;
                self.emit_checkout_failed(CheckOutFailedReason::ConnectionError);
                return Err(e);
            }
            if let Some(handler) = &self.event_handler {
                handler.handle_connection_ready_event(CmapEvent::ConnectionReady {
                    address: self.address.clone(),
                    connection_id: id as u32,
                    duration: start.elapsed(),
                });
            }
            permit.forget();
            return Ok(conn);
        }
    }

    fn emit_checkout_failed(&self, reason: CheckOutFailedReason) {
        if let Some(handler) = &self.event_handler {
            handler.handle_connection_checkout_failed_event(CmapEvent::ConnectionCheckOutFailed {
                address: self.address.clone(),
                reason,
            });
        }
    }

    async fn acquire_permit(&self, deadline: Option<Instant>) -> Result<tokio::sync::OwnedSemaphorePermit> {
        let semaphore = self.semaphore.clone();
        let acquire = semaphore.acquire_owned();
        let result = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::timeout(remaining, acquire).await.map_err(|_| {
                    Error::from(ErrorKind::Pool(PoolError::WaitQueueTimeout { address: self.address.clone() }))
                })?
            }
            None => acquire.await,
        };
        result.map_err(|_| ErrorKind::Pool(PoolError::Closed { address: self.address.clone() }).into())
    }

    /// Returns `conn` to the idle list unless it is expired, dead, or stamped with a stale
    /// generation (from a `drain()` that happened while it was checked out). Never suspends
    /// (§5). A destroyed connection's permit is released back to the semaphore; a connection kept
    /// idle keeps holding the permit it was created with (see [`Self::checkout`]).
    pub(crate) async fn checkin(&self, mut conn: Connection) {
        let mut inner = self.inner.lock().await;
        let stale = conn.generation != inner.generation;
        if stale || conn.expired() {
            if let Some(handler) = &self.event_handler {
                handler.handle_connection_closed_event(CmapEvent::ConnectionClosed {
                    address: self.address.clone(),
                    connection_id: conn.id as u32,
                    reason: if stale { ConnectionClosedReason::Stale } else { ConnectionClosedReason::Error },
                });
            }
            drop(inner);
            conn.close().await;
            self.semaphore.add_permits(1);
        } else {
            if let Some(handler) = &self.event_handler {
                handler.handle_connection_checked_in_event(CmapEvent::ConnectionCheckedIn {
                    address: self.address.clone(),
                    connection_id: conn.id as u32,
                });
            }
            inner.idle.push(conn);
        }
    }

    /// Bumps `generation` and drops all idle connections, releasing the permit each one held;
    /// in-use connections are invalidated (and their permits released) lazily when they are next
    /// checked in (§4.3, §9 Generation).
    pub(crate) async fn drain(&self, cause: &Error) {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        inner.state = PoolState::Paused;
        let stale: Vec<Connection> = std::mem::take(&mut inner.idle);
        drop(inner);
        for mut conn in stale {
            conn.close().await;
            self.semaphore.add_permits(1);
        }
        if let Some(handler) = &self.event_handler {
            handler.handle_pool_cleared_event(CmapEvent::PoolCleared {
                address: self.address.clone(),
                cause: cause.to_string(),
            });
        }
    }

    pub(crate) async fn close(&self) {
        let dummy = Error::from(ErrorKind::Internal { message: "pool closed".into() });
        self.drain(&dummy).await;
        let mut inner = self.inner.lock().await;
        inner.state = PoolState::Closed;
        if let Some(handler) = &self.event_handler {
            handler.handle_pool_closed_event(CmapEvent::PoolClosed { address: self.address.clone() });
        }
    }

    #[cfg(test)]
    pub(crate) async fn idle_len(&self) -> usize {
        self.inner.lock().await.idle.len()
    }
}

async fn run_maintenance_loop(pool: Weak<ConnectionPool>) {
    loop {
        match pool.upgrade() {
            Some(pool) => {
                pool.reap_perished().await;
                pool.top_up_to_min_pool_size().await;
            }
            None => return,
        }
        tokio::time::sleep(MAINTENANCE_INTERVAL).await;
    }
}

/// Runs the `hello`/`isMaster` handshake on a standalone, never-pooled connection — the
/// dedicated monitoring connection (§4.5: "no auth, no compression").
pub(crate) async fn open_monitoring_connection(
    address: ServerAddress,
    options: &ClientOptions,
    handshaker: &Handshaker,
) -> Result<(Connection, ServerDescription)> {
    let mut conn = Connection::open(0, address, 0, options).await?;
    let description = handshaker
        .handshake(&mut conn, options, HandshakeProtocol::Hello, None)
        .await?;
    Ok((conn, description))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    fn test_pool(uri: &str) -> ConnectionPool {
        let options = Arc::new(crate::options::parse(uri).unwrap());
        let address = options.hosts[0].clone();
        let handshaker = Arc::new(Handshaker::new(options.compressors.clone().unwrap_or_default()));
        ConnectionPool::new(address, options, handshaker, None, None)
    }

    #[test]
    fn new_pool_clamps_max_pool_size_to_at_least_one() {
        let pool = test_pool("mongodb://localhost/?maxPoolSize=0");
        assert_eq!(pool.max, 1);
    }

    #[test]
    fn new_pool_clamps_min_pool_size_to_max_pool_size() {
        let pool = test_pool("mongodb://localhost/?maxPoolSize=2&minPoolSize=10");
        assert_eq!(pool.min_pool_size, 2);
    }

    #[tokio::test]
    async fn checkout_on_closed_pool_fails_without_dialing() {
        let pool = test_pool("mongodb://localhost:1/?maxPoolSize=1");
        pool.close().await;

        let err = pool.checkout(None).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Pool(PoolError::Closed { .. })));
    }

    #[tokio::test]
    async fn close_drains_idle_connections_and_releases_their_permits() {
        let pool = test_pool("mongodb://localhost/?maxPoolSize=4");
        assert_eq!(pool.idle_len().await, 0);
        assert_eq!(pool.semaphore.available_permits(), 4);

        pool.close().await;

        assert_eq!(pool.idle_len().await, 0);
        // draining an already-empty idle list must not create extra permits
        assert_eq!(pool.semaphore.available_permits(), 4);
    }

    #[tokio::test]
    async fn mark_ready_is_idempotent() {
        let pool = test_pool("mongodb://localhost/");
        pool.mark_ready().await;
        pool.mark_ready().await;
        assert_eq!(pool.inner.lock().await.state, PoolState::Ready);
    }

    #[tokio::test]
    async fn checkout_times_out_without_dialing_a_second_connection_when_pool_is_full() {
        // Hold the pool's only permit directly, standing in for an already checked-out
        // connection, so `checkout` is forced onto the waiter queue and never reaches
        // `Connection::open` (§8 boundary scenario 5: "without creating a second connection").
        let pool = test_pool("mongodb://localhost:1/?maxPoolSize=1");
        let held_permit = pool.semaphore.clone().try_acquire_owned().unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        let started = Instant::now();
        let err = pool.checkout(Some(deadline)).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(matches!(err.kind(), ErrorKind::Pool(PoolError::WaitQueueTimeout { .. })));

        // the waiter was not leaked: releasing the held permit immediately unblocks a
        // subsequent acquire.
        drop(held_permit);
        assert_eq!(pool.semaphore.available_permits(), 1);
    }
}
