//! `ClientSession`/`ServerSession` and the transaction state used to shape a single command
//! (§4.10). Full transaction lifecycle (`start_transaction`, `with_transaction`, commit/abort
//! retry) is CRUD/session-surface and out of scope; only the state the operation executor reads
//! is kept.

use std::time::{Duration, Instant};

use bson::{doc, spec::BinarySubtype, Binary, Document};
use uuid::Uuid;

use crate::{options::ServerAddress, sdam::cluster_time::ClusterTime};

/// Where a transaction currently stands, used solely to decide which of
/// `startTransaction`/`autocommit`/`readConcern.afterClusterTime` fields the executor appends
/// (§4.8 step 2, §4.10).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionState {
    None,
    Starting,
    InProgress,
    Committed,
    Aborted,
}

/// The server-side identity backing a [`ClientSession`]: the `lsid` document and the
/// monotonically increasing `txnNumber` (§3 Session).
#[derive(Debug)]
pub struct ServerSession {
    id: Document,
    last_use: Instant,
    dirty: bool,
    txn_number: i64,
}

impl ServerSession {
    pub fn new() -> Self {
        let binary = Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        };
        ServerSession {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Whether this session will expire within the next minute, per the pool's eviction rule.
    pub fn is_about_to_expire(&self, logical_session_timeout: Duration) -> bool {
        let expiration = self.last_use + logical_session_timeout;
        expiration < Instant::now() + Duration::from_secs(60)
    }
}

impl Default for ServerSession {
    fn default() -> Self {
        Self::new()
    }
}

/// The subset of the full `ClientSession` the core driver plane attributes to a session (§3):
/// `id`, `lastUse`, `txnNumber`, `clusterTime`, `operationTime`, and an optional pinned server for
/// sharded transactions / load-balancer mode.
#[derive(Debug)]
pub struct ClientSession {
    server_session: ServerSession,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<bson::Timestamp>,
    causal_consistency: bool,
    pinned_server: Option<ServerAddress>,
    transaction_state: TransactionState,
}

impl ClientSession {
    pub fn new(causal_consistency: bool) -> Self {
        ClientSession {
            server_session: ServerSession::new(),
            cluster_time: None,
            operation_time: None,
            causal_consistency,
            pinned_server: None,
            transaction_state: TransactionState::None,
        }
    }

    pub fn id(&self) -> &Document {
        &self.server_session.id
    }

    pub fn txn_number(&self) -> i64 {
        self.server_session.txn_number
    }

    pub fn increment_txn_number(&mut self) {
        self.server_session.txn_number += 1;
    }

    pub fn get_and_increment_txn_number(&mut self) -> i64 {
        self.increment_txn_number();
        self.server_session.txn_number
    }

    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Advances this session's cluster time per the standard `max(known, received)` rule
    /// (§4.6, §4.8 step 4).
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        ClusterTime::advance(&mut self.cluster_time, to.clone());
    }

    pub fn operation_time(&self) -> Option<bson::Timestamp> {
        self.operation_time
    }

    pub fn advance_operation_time(&mut self, ts: bson::Timestamp) {
        self.operation_time = match self.operation_time {
            Some(current) if current >= ts => Some(current),
            _ => Some(ts),
        };
    }

    pub fn causal_consistency(&self) -> bool {
        self.causal_consistency
    }

    pub fn pinned_server(&self) -> Option<&ServerAddress> {
        self.pinned_server.as_ref()
    }

    pub fn pin_to_server(&mut self, address: ServerAddress) {
        self.pinned_server = Some(address);
    }

    pub fn unpin_server(&mut self) {
        self.pinned_server = None;
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.transaction_state
    }

    pub fn start_transaction(&mut self) {
        self.transaction_state = TransactionState::Starting;
    }

    /// Transitions `Starting` to `InProgress` after the first command of a transaction has been
    /// sent; subsequent commands in the same transaction omit `startTransaction`/`autocommit`.
    pub fn advance_transaction_state(&mut self) {
        if self.transaction_state == TransactionState::Starting {
            self.transaction_state = TransactionState::InProgress;
        }
    }

    pub fn commit_transaction(&mut self) {
        self.transaction_state = TransactionState::Committed;
    }

    pub fn abort_transaction(&mut self) {
        self.transaction_state = TransactionState::Aborted;
        self.pinned_server = None;
    }

    pub fn reset_transaction(&mut self) {
        self.transaction_state = TransactionState::None;
        self.pinned_server = None;
    }

    pub fn in_transaction(&self) -> bool {
        matches!(self.transaction_state, TransactionState::Starting | TransactionState::InProgress)
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.server_session.dirty = true;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.server_session.dirty
    }

    pub(crate) fn update_last_use(&mut self) {
        self.server_session.last_use = Instant::now();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn txn_number_increments_monotonically() {
        let mut session = ClientSession::new(false);
        assert_eq!(session.get_and_increment_txn_number(), 1);
        assert_eq!(session.get_and_increment_txn_number(), 2);
    }

    #[test]
    fn starting_transitions_to_in_progress_once() {
        let mut session = ClientSession::new(false);
        session.start_transaction();
        assert_eq!(session.transaction_state(), TransactionState::Starting);
        session.advance_transaction_state();
        assert_eq!(session.transaction_state(), TransactionState::InProgress);
        session.advance_transaction_state();
        assert_eq!(session.transaction_state(), TransactionState::InProgress);
    }

    #[test]
    fn operation_time_only_moves_forward() {
        let mut session = ClientSession::new(false);
        session.advance_operation_time(bson::Timestamp { time: 5, increment: 0 });
        session.advance_operation_time(bson::Timestamp { time: 2, increment: 0 });
        assert_eq!(session.operation_time(), Some(bson::Timestamp { time: 5, increment: 0 }));
    }
}
