//! Contains the `Error` and `Result` types used throughout this crate.

use std::{collections::HashSet, fmt, sync::Arc};

use thiserror::Error;

use crate::options::ServerAddress;

/// Error codes (from the MongoDB server) that indicate a node is stepping down or otherwise no
/// longer able to serve as primary. Used by `Error::is_not_master`.
const NOT_MASTER_CODES: [i32; 3] = [10107, 13435, 13436];
/// Error codes that indicate the node is recovering and temporarily unable to serve reads/writes.
const NODE_IS_RECOVERING_CODES: [i32; 3] = [11600, 11602, 189];
/// Combined set used by `Server::process_error` (spec §4.8 step 5) to decide whether an error
/// should mark a server Unknown and drain its pool.
const STATE_CHANGE_CODES: [i32; 7] = [11600, 11602, 10107, 13435, 13436, 189, 91];
const RETRYABLE_READ_CODES: [i32; 10] = [11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 9001];
const RETRYABLE_WRITE_CODES: [i32; 9] = [11600, 11602, 10107, 13435, 13436, 189, 91, 7, 9001];

/// Label attached to network-level errors and to errors observed while a transaction is open.
pub const NETWORK_ERROR: &str = "NetworkError";
/// Label attached to an error that is safe to retry as a write.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Label attached to a network error or server selection error observed during a transaction.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in this crate. The inner [`ErrorKind`] is wrapped in an `Arc` so that
/// `Error` is cheaply cloneable, which is required because the same error is frequently reported
/// to both an event handler and the caller that triggered it (§7).
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    kind: Arc<ErrorKind>,
    labels: HashSet<String>,
    /// The max wire version of the connection the error occurred on, if any. Used to decide
    /// whether a `RetryableWriteError` label applies (pre-4.4 servers get the label on any
    /// write-retryable error; 4.4+ only on network errors).
    pub(crate) wire_version: Option<i32>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            kind: Arc::new(kind),
            labels: labels.into_iter().collect(),
            wire_version: None,
        }
    }

    pub(crate) fn without_labels(kind: ErrorKind) -> Self {
        Self::new(kind, std::iter::empty())
    }

    /// The specific kind of error that occurred.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The error labels attached to this error, per §7.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub(crate) fn add_label(&mut self, label: impl Into<String>) {
        self.labels.insert(label.into());
    }

    /// True for any I/O, TLS, or codec-level failure; always fatal for the connection it
    /// occurred on (§7 TransportError / CodecError).
    pub fn is_network_error(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::Io(_) | ErrorKind::Tls(_) | ErrorKind::InvalidResponse { .. }
        )
    }

    pub fn is_server_selection_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::ServerSelection { .. })
    }

    pub fn is_pool_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Pool(_))
    }

    /// True for a server reply carrying one of the not-master / node-is-recovering codes, or
    /// whose message contains the corresponding legacy text (§4.8 step 5).
    pub fn is_state_change_error(&self) -> bool {
        match &*self.kind {
            ErrorKind::Command(e) => {
                STATE_CHANGE_CODES.contains(&e.code)
                    || e.message.contains("not master")
                    || e.message.contains("node is recovering")
            }
            _ => false,
        }
    }

    pub fn is_not_master(&self) -> bool {
        matches!(&*self.kind, ErrorKind::Command(e) if NOT_MASTER_CODES.contains(&e.code))
    }

    pub fn is_node_is_recovering(&self) -> bool {
        matches!(&*self.kind, ErrorKind::Command(e) if NODE_IS_RECOVERING_CODES.contains(&e.code))
    }

    /// Whether this error is eligible for a single retry as a read, per §4.8 step 6.
    pub fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        match &*self.kind {
            ErrorKind::Command(e) => RETRYABLE_READ_CODES.contains(&e.code),
            _ => false,
        }
    }

    /// Whether this error is eligible for a single retry as a write, per §4.8 step 6. A write is
    /// retryable if the server advertised `RetryableWriteError` explicitly, or the error is a
    /// network-level failure.
    pub fn is_write_retryable(&self) -> bool {
        if self.contains_label(RETRYABLE_WRITE_ERROR) {
            return true;
        }
        if self.is_network_error() {
            return true;
        }
        match &*self.kind {
            ErrorKind::Command(e) => RETRYABLE_WRITE_CODES.contains(&e.code),
            _ => false,
        }
    }

    pub(crate) fn pool_cleared(address: &ServerAddress, cause: &Error) -> Self {
        Self::new(
            ErrorKind::Pool(PoolError::Cleared {
                address: address.clone(),
                cause: Box::new(cause.clone()),
            }),
            std::iter::empty(),
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        ErrorKind::Authentication {
            message: message.into(),
        }
        .into()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::without_labels(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(e)).into()
    }
}

impl From<bson::ser::Error> for Error {
    fn from(e: bson::ser::Error) -> Self {
        ErrorKind::InvalidArgument {
            message: e.to_string(),
        }
        .into()
    }
}

impl From<bson::de::Error> for Error {
    fn from(e: bson::de::Error) -> Self {
        ErrorKind::InvalidResponse {
            message: e.to_string(),
        }
        .into()
    }
}

impl From<bson::raw::Error> for Error {
    fn from(e: bson::raw::Error) -> Self {
        ErrorKind::InvalidResponse {
            message: e.to_string(),
        }
        .into()
    }
}

/// The particular type of error encountered. Cheap to match on; boxed behind `Error` so callers
/// pay for the `Arc` clone rather than a deep copy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Wraps I/O errors from the underlying socket. Always a fatal, connection-closing error
    /// (§7 TransportError).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// A TLS handshake or certificate verification failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The wire codec encountered a malformed header, opcode, or document (§4.1, §7 CodecError).
    #[error("invalid server response: {message}")]
    InvalidResponse { message: String },

    /// A caller-supplied argument was invalid (e.g. an empty command document).
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// `ok: 0` was returned from a command (§7 CommandError).
    #[error("command failed with error {}: {}", .0.code, .0.message)]
    Command(CommandError),

    /// Errors from the connection pool (§7 PoolError).
    #[error("connection pool error: {0}")]
    Pool(PoolError),

    /// Server selection could not find a suitable server or the deployment was incompatible
    /// (§7 SelectionError).
    #[error("server selection error: {message}")]
    ServerSelection { message: String },

    /// The SASL conversation (§4.9) failed or was driven out of order.
    #[error("authentication error: {message}")]
    Authentication { message: String },

    /// Sessions are not supported by the connected deployment.
    #[error("sessions are not supported by this server")]
    SessionsNotSupported,

    /// An internal invariant was violated; indicates a driver bug rather than a server/network
    /// condition.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// The client has been shut down and can no longer be used.
    #[error("client has been shut down")]
    Shutdown,

    /// An SRV or TXT DNS lookup performed while resolving a `mongodb+srv://` connection string
    /// (§4.11) failed or returned a malformed result.
    #[error("DNS resolution error: {message}")]
    DnsResolve { message: String },
}

/// The body of an `ok: 0` command response (§7 CommandError).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CommandError {
    pub code: i32,
    #[serde(rename = "codeName", default)]
    pub code_name: String,
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.code_name, self.message)
    }
}

/// Errors produced by the connection pool (§4.3, §7).
#[derive(Debug, Error, Clone)]
pub enum PoolError {
    #[error("connection pool for {address} is closed")]
    Closed { address: ServerAddress },

    #[error("timed out waiting for a connection from the pool for {address}")]
    WaitQueueTimeout { address: ServerAddress },

    #[error("connection pool for {address} was cleared because of the following error: {cause}")]
    Cleared {
        address: ServerAddress,
        cause: Box<Error>,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn not_master_is_both_state_change_and_write_retryable() {
        let err: Error = ErrorKind::Command(CommandError {
            code: 10107,
            code_name: "NotWritablePrimary".into(),
            message: "not master".into(),
        })
        .into();
        assert!(err.is_not_master());
        assert!(err.is_state_change_error());
        assert!(err.is_write_retryable());
        assert!(err.is_read_retryable());
    }

    #[test]
    fn retryable_write_label_is_explicit() {
        let mut err: Error = ErrorKind::Command(CommandError {
            code: 1,
            code_name: "InternalError".into(),
            message: "boom".into(),
        })
        .into();
        assert!(!err.is_write_retryable());
        err.add_label(RETRYABLE_WRITE_ERROR);
        assert!(err.is_write_retryable());
    }

    #[test]
    fn io_errors_are_network_and_retryable() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_network_error());
        assert!(err.is_read_retryable());
        assert!(err.is_write_retryable());
    }
}
