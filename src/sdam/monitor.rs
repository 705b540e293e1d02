//! One heartbeat task per known address (§4.5).

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::sync::{watch, Notify};

use crate::{
    cmap::{open_monitoring_connection, Connection, ConnectionPool, Handshaker, MIN_HEARTBEAT_INTERVAL},
    error::Error,
    event::sdam::{SdamEvent, SdamEventHandler},
    options::{ClientOptions, ServerAddress},
    sdam::description::ServerDescription,
};

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MonitorState {
    Unstarted = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

/// Handle used by server selection to ask a monitor to re-check sooner than its regular
/// interval, and by the owning `Server` to stop it (§4.5, §4.7 step 3).
pub(crate) struct MonitorHandle {
    immediate_check: Arc<Notify>,
    state: Arc<AtomicU8>,
    last_request: std::sync::Mutex<Instant>,
}

impl MonitorHandle {
    pub(crate) fn request_immediate_check(&self) {
        let mut last = self.last_request.lock().unwrap();
        if last.elapsed() < MIN_HEARTBEAT_INTERVAL {
            return;
        }
        *last = Instant::now();
        self.immediate_check.notify_one();
    }

    pub(crate) fn stop(&self) {
        self.state.store(MonitorState::Stopping as u8, Ordering::SeqCst);
        self.immediate_check.notify_one();
    }

    pub(crate) fn state(&self) -> MonitorState {
        match self.state.load(Ordering::SeqCst) {
            0 => MonitorState::Unstarted,
            1 => MonitorState::Running,
            2 => MonitorState::Stopping,
            _ => MonitorState::Stopped,
        }
    }
}

pub(crate) struct Monitor {
    address: ServerAddress,
    options: Arc<ClientOptions>,
    handshaker: Arc<Handshaker>,
    pool: Arc<ConnectionPool>,
    publisher: watch::Sender<ServerDescription>,
    event_handler: Option<Arc<dyn SdamEventHandler>>,
    immediate_check: Arc<Notify>,
    state: Arc<AtomicU8>,
    conn: Option<Connection>,
    last_description: Option<ServerDescription>,
}

impl Monitor {
    pub(crate) fn spawn(
        address: ServerAddress,
        options: Arc<ClientOptions>,
        handshaker: Arc<Handshaker>,
        pool: Arc<ConnectionPool>,
        publisher: watch::Sender<ServerDescription>,
        event_handler: Option<Arc<dyn SdamEventHandler>>,
    ) -> Arc<MonitorHandle> {
        let state = Arc::new(AtomicU8::new(MonitorState::Unstarted as u8));
        let immediate_check = Arc::new(Notify::new());
        let handle = Arc::new(MonitorHandle {
            immediate_check: immediate_check.clone(),
            state: state.clone(),
            last_request: std::sync::Mutex::new(Instant::now() - MIN_HEARTBEAT_INTERVAL),
        });

        let monitor = Monitor {
            address,
            options,
            handshaker,
            pool,
            publisher,
            event_handler,
            immediate_check,
            state,
            conn: None,
            last_description: None,
        };
        tokio::spawn(monitor.run());
        handle
    }

    async fn run(mut self) {
        self.state.store(MonitorState::Running as u8, Ordering::SeqCst);
        let mut last_heartbeat = Instant::now() - self.options.heartbeat_freq;

        loop {
            if self.state.load(Ordering::SeqCst) == MonitorState::Stopping as u8 {
                break;
            }

            let since_last = last_heartbeat.elapsed();
            let wait = self.options.heartbeat_freq.saturating_sub(since_last);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.immediate_check.notified() => {}
            }
            if self.state.load(Ordering::SeqCst) == MonitorState::Stopping as u8 {
                break;
            }

            let elapsed_since_heartbeat = last_heartbeat.elapsed();
            if elapsed_since_heartbeat < MIN_HEARTBEAT_INTERVAL {
                tokio::time::sleep(MIN_HEARTBEAT_INTERVAL - elapsed_since_heartbeat).await;
            }
            last_heartbeat = Instant::now();

            self.emit(SdamEvent::ServerHeartbeatStarted { address: self.address.clone() });
            let start = Instant::now();
            match self.heartbeat().await {
                Ok(description) => {
                    self.emit(SdamEvent::ServerHeartbeatSucceeded {
                        address: self.address.clone(),
                        duration: start.elapsed(),
                    });
                    self.last_description = Some(description.clone());
                    let _ = self.publisher.send(description);
                }
                Err(e) => {
                    self.emit(SdamEvent::ServerHeartbeatFailed {
                        address: self.address.clone(),
                        duration: start.elapsed(),
                        message: e.to_string(),
                    });
                    if should_drain_on_monitor_error(&e) {
                        self.pool.drain(&e).await;
                    }
                    let unknown = ServerDescription::with_error(self.address.clone(), e);
                    self.last_description = Some(unknown.clone());
                    let _ = self.publisher.send(unknown);

                    // §4.5: retry once immediately after a heartbeat failure.
                    if let Ok(description) = self.heartbeat().await {
                        self.last_description = Some(description.clone());
                        let _ = self.publisher.send(description);
                    }
                }
            }
        }

        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        self.state.store(MonitorState::Stopped as u8, Ordering::SeqCst);
    }

    async fn heartbeat(&mut self) -> Result<ServerDescription, Error> {
        if self.conn.is_none() {
            let (conn, description) =
                open_monitoring_connection(self.address.clone(), &self.options, &self.handshaker).await?;
            self.conn = Some(conn);
            return Ok(self.apply_ewma(description));
        }

        let mut conn = self.conn.take().unwrap();
        match self.handshaker.handshake(&mut conn, &self.options, crate::cmap::HandshakeProtocol::Hello, None).await {
            Ok(description) => {
                self.conn = Some(conn);
                Ok(self.apply_ewma(description))
            }
            Err(e) => {
                conn.close().await;
                Err(e)
            }
        }
    }

    fn apply_ewma(&self, mut description: ServerDescription) -> ServerDescription {
        if let (Some(sample), Some(prev)) = (description.average_rtt, self.last_description.as_ref().and_then(|d| d.average_rtt)) {
            let sample_ms = sample.as_secs_f64() * 1000.0;
            let prev_ms = prev.as_secs_f64() * 1000.0;
            let new_ms = 0.2 * sample_ms + 0.8 * prev_ms;
            description.average_rtt = Some(Duration::from_secs_f64((new_ms / 1000.0).max(0.0)));
        }
        description
    }

    fn emit(&self, event: SdamEvent) {
        if let Some(handler) = &self.event_handler {
            match &event {
                SdamEvent::ServerHeartbeatStarted { .. } => handler.handle_server_heartbeat_started_event(event),
                SdamEvent::ServerHeartbeatSucceeded { .. } => handler.handle_server_heartbeat_succeeded_event(event),
                SdamEvent::ServerHeartbeatFailed { .. } => handler.handle_server_heartbeat_failed_event(event),
                _ => {}
            }
        }
    }
}

/// A heartbeat failure drains the owning pool iff it is a `NotMaster`/`NodeRecovering` command
/// error or a network error that is not a simple timeout (§4.5).
fn should_drain_on_monitor_error(error: &Error) -> bool {
    if error.is_state_change_error() {
        return true;
    }
    if error.is_network_error() {
        return !matches!(
            error.kind(),
            crate::error::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::TimedOut
        );
    }
    false
}
