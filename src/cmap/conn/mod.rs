//! A single connection to a server: one TCP (optionally TLS) socket, strictly ordered
//! request/response, deadlines, and compression (§4.2, §3 ConnectionRecord).

pub(crate) mod stream;
pub(crate) mod wire;

use std::{
    sync::atomic::{AtomicI32, Ordering},
    time::{Duration, Instant},
};

use bson::RawDocumentBuf;
use tokio::io::{AsyncWriteExt, BufReader};

use self::{stream::AsyncStream, wire::WireMessage};
use crate::{
    compression::Compressor,
    error::{Error, ErrorKind, Result},
    options::{ClientOptions, ServerAddress},
};

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Allocates the next process-monotonic `requestId` (§6: "process-monotonic uint32 wrapping").
/// Wrapping is automatic because `AtomicI32::fetch_add` wraps on overflow.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// The subset of a handshake's resulting `ServerDescription` a `Connection` needs to shape
/// traffic: wire version (to decide `OP_MSG` vs legacy `OP_QUERY`) and the negotiated compressor.
#[derive(Clone, Debug, Default)]
pub struct StreamDescription {
    pub max_wire_version: i32,
    pub compressor: Option<Compressor>,
    pub server_connection_id: Option<i64>,
}

/// An established, handshaken connection to one server (§3 ConnectionRecord, §4.2).
pub struct Connection {
    pub id: u64,
    pub address: ServerAddress,
    pub generation: u64,
    stream: BufReader<AsyncStream>,
    pub stream_description: StreamDescription,
    established_at: Instant,
    last_used_at: Instant,
    max_idle_time: Option<Duration>,
    max_lifetime: Option<Duration>,
    dead: bool,
}

impl Connection {
    /// Dials the socket and (optionally) negotiates TLS. Does not run the handshake itself —
    /// that is the pool/handshaker's job, so a dedicated monitoring connection can skip it
    /// entirely (§4.5: "no auth, no compression").
    pub(crate) async fn open(
        id: u64,
        address: ServerAddress,
        generation: u64,
        options: &ClientOptions,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(
            options.connect_timeout,
            AsyncStream::connect(&address, options.tls.as_ref()),
        )
        .await
        .map_err(|_| ErrorKind::Io(std::sync::Arc::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connecting to {address} exceeded connectTimeoutMS"),
        ))))??;

        let now = Instant::now();
        Ok(Connection {
            id,
            address,
            generation,
            stream: BufReader::new(stream),
            stream_description: StreamDescription::default(),
            established_at: now,
            last_used_at: now,
            max_idle_time: none_if_zero(options.max_idle_time),
            max_lifetime: None,
            dead: false,
        })
    }

    /// Sends `command` as an `OP_MSG`, compressing it unless the command is in the
    /// non-compressible set (§4.1). Marks the connection dead on any I/O error.
    pub(crate) async fn write_command(&mut self, command: RawDocumentBuf, timeout: Option<Duration>) -> Result<i32> {
        let request_id = next_request_id();
        let compressor = self.stream_description.compressor;
        let fut = WireMessage::write_command(&mut self.stream, request_id, command, compressor);
        let result = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .unwrap_or_else(|_| Err(timeout_error(&self.address, "write"))),
            None => fut.await,
        };
        if result.is_err() {
            self.dead = true;
        } else {
            self.last_used_at = Instant::now();
        }
        result.map(|_| request_id)
    }

    /// Reads exactly one wire message, unwrapping `OP_COMPRESSED` transparently. Marks the
    /// connection dead on any I/O or codec error, and closes the socket on cancellation because a
    /// partially-consumed response cannot be trusted (§4.2).
    pub(crate) async fn read_message(&mut self, timeout: Option<Duration>) -> Result<wire::Message> {
        let fut = WireMessage::read(&mut self.stream);
        let result = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(r) => r,
                Err(_) => {
                    self.close().await;
                    return Err(timeout_error(&self.address, "read"));
                }
            },
            None => fut.await,
        };
        match result {
            Ok(WireMessage::Msg(msg)) => {
                self.last_used_at = Instant::now();
                Ok(msg)
            }
            Ok(WireMessage::Reply(_)) => {
                self.dead = true;
                Err(ErrorKind::InvalidResponse {
                    message: "received a legacy OP_REPLY on a post-handshake connection".into(),
                }
                .into())
            }
            Err(e) => {
                self.dead = true;
                Err(e)
            }
        }
    }

    /// True if this connection should never be checked out again: past its idle/lifetime
    /// deadline, or already marked dead by a prior I/O failure (§4.2 `expired()`, §3 lifecycle).
    pub(crate) fn expired(&self) -> bool {
        if self.dead {
            return true;
        }
        if let Some(max_idle) = self.max_idle_time {
            if self.last_used_at.elapsed() >= max_idle {
                return true;
            }
        }
        if let Some(max_lifetime) = self.max_lifetime {
            if self.established_at.elapsed() >= max_lifetime {
                return true;
            }
        }
        false
    }

    pub(crate) fn mark_dead(&mut self) {
        self.dead = true;
    }

    pub(crate) async fn close(&mut self) {
        self.dead = true;
        let _ = self.stream.shutdown().await;
    }
}

fn none_if_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

fn timeout_error(address: &ServerAddress, op: &str) -> Error {
    ErrorKind::Io(std::sync::Arc::new(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{op} to {address} timed out"),
    )))
    .into()
}
