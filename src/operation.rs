//! The operation executor (§4.8): binds a command document, a server selected through
//! [`Topology::select`], an optional session, and the shared cluster clock into one wire
//! round-trip, with the exact field ordering required for byte-comparable wiremessages.

use std::time::Duration;

use bson::Document;

use crate::{
    bson_util,
    error::{CommandError, Error, ErrorKind, Result},
    options::{ReadConcern, WriteConcern},
    sdam::{cluster_time::ClusterTime, Topology},
    selection_criteria::{ReadPreference, SelectionCriteria},
    session::{ClientSession, TransactionState},
};

/// A generic command operation: an arbitrary command document run against `db`. Because concrete
/// CRUD operations (find/insert/update/aggregate/...) are out of scope, this is the single
/// operation type the executor is exercised through (§4.8.1).
#[derive(Clone, Debug)]
pub struct RunCommand {
    pub db: String,
    pub command: Document,
    pub max_time: Option<Duration>,
}

impl RunCommand {
    pub fn new(db: impl Into<String>, command: Document) -> Self {
        RunCommand {
            db: db.into(),
            command,
            max_time: None,
        }
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }
}

/// The fields extracted from a successful response for session/cluster-clock bookkeeping (§4.8
/// step 4), alongside the full reply document.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub body: Document,
}

/// Runs `op` against a server chosen by `criteria`, applying the standard field-ordering and
/// session/cluster-time machinery, and classifying the resulting error per §4.8 steps 5–6.
///
/// On a state-change error (a `NotMaster`/`NodeIsRecovering` code, or a network error), the
/// owning server is marked Unknown and its pool drained via [`Topology::process_error`] before
/// the error is returned.
pub async fn execute_operation(
    topology: &Topology,
    criteria: &SelectionCriteria,
    mut session: Option<&mut ClientSession>,
    write_concern: Option<&WriteConcern>,
    read_concern: Option<&ReadConcern>,
    op: RunCommand,
) -> Result<CommandResponse> {
    let (address, pool) = topology.select(criteria).await?;
    let mut conn = topology.checkout_connection(&pool).await?;

    let command = build_command_document(topology, criteria, session.as_deref(), write_concern, read_concern, &op);
    let raw = match bson_util::to_raw_document_buf(&command) {
        Ok(raw) => raw,
        Err(e) => {
            pool.checkin(conn).await;
            return Err(e);
        }
    };

    let result = async {
        conn.write_command(raw, None).await?;
        let message = conn.read_message(None).await?;
        let reply: Document = bson::from_slice(message.command_document()?.as_bytes())?;
        Ok(reply)
    }
    .await;

    let result = result.and_then(|reply| parse_response(reply, &mut session, topology));

    match &result {
        Ok(_) => pool.checkin(conn).await,
        Err(e) => {
            if e.is_state_change_error() || e.is_network_error() {
                topology.process_error(&address, e).await;
            }
            conn.mark_dead();
            pool.checkin(conn).await;
        }
    }

    result
}

/// Builds the final command document in the precise field order §4.8 step 2 requires:
/// `<commandName>:<arg>`, then `$db`, `lsid`, `txnNumber`, `startTransaction`, `autocommit`,
/// `readConcern`, `writeConcern`, `$clusterTime`, `$readPreference`, `maxTimeMS`.
fn build_command_document(
    topology: &Topology,
    criteria: &SelectionCriteria,
    session: Option<&ClientSession>,
    write_concern: Option<&WriteConcern>,
    read_concern: Option<&ReadConcern>,
    op: &RunCommand,
) -> Document {
    let mut command = op.command.clone();
    command.insert("$db", op.db.clone());

    if let Some(session) = &session {
        command.insert("lsid", session.id().clone());

        if session.in_transaction() {
            command.insert("txnNumber", session.txn_number());
            if session.transaction_state() == TransactionState::Starting {
                command.insert("startTransaction", true);
            }
            command.insert("autocommit", false);
        }
    }

    let after_cluster_time = session
        .filter(|s| s.causal_consistency())
        .and_then(|s| s.operation_time());
    if read_concern.is_some() || after_cluster_time.is_some() {
        let mut rc = Document::new();
        if let Some(read_concern) = read_concern {
            if !read_concern.level.is_empty() {
                rc.insert("level", read_concern.level.clone());
            }
        }
        if let Some(ts) = after_cluster_time {
            rc.insert("afterClusterTime", ts);
        }
        command.insert("readConcern", rc);
    }

    if let Some(write_concern) = write_concern {
        if let Ok(wc) = bson::to_bson(write_concern) {
            command.insert("writeConcern", wc);
        }
    }

    let cluster_time = merged_cluster_time(topology, session);
    if let Some(cluster_time) = cluster_time {
        command.insert("$clusterTime", cluster_time.0);
    }

    if let SelectionCriteria::ReadPreference(rp) = criteria {
        if !matches!(rp, ReadPreference::Primary) {
            command.insert("$readPreference", read_preference_document(rp));
        }
    }

    if let Some(max_time) = op.max_time {
        command.insert("maxTimeMS", max_time.as_millis() as i64);
    }

    command
}

fn merged_cluster_time(topology: &Topology, session: Option<&ClientSession>) -> Option<ClusterTime> {
    let topology_time = topology.cluster_clock().current();
    let session_time = session.and_then(|s| s.cluster_time().cloned());
    match (topology_time, session_time) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn read_preference_document(rp: &ReadPreference) -> Document {
    let mode = match rp {
        ReadPreference::Primary => "primary",
        ReadPreference::PrimaryPreferred { .. } => "primaryPreferred",
        ReadPreference::Secondary { .. } => "secondary",
        ReadPreference::SecondaryPreferred { .. } => "secondaryPreferred",
        ReadPreference::Nearest { .. } => "nearest",
    };
    bson::doc! { "mode": mode }
}

/// Parses a command reply per §4.8 step 4: extracts `ok`/error fields, advances the session and
/// the topology's cluster clock from `$clusterTime`/`operationTime`, and maps `ok: 0` onto
/// [`ErrorKind::Command`] with `errorLabels` attached.
fn parse_response(
    reply: Document,
    session: &mut Option<&mut ClientSession>,
    topology: &Topology,
) -> Result<CommandResponse> {
    if let Ok(ct_doc) = reply.get_document("$clusterTime") {
        let ct = ClusterTime(ct_doc.clone());
        topology.cluster_clock().advance(ct.clone());
        if let Some(session) = session {
            session.advance_cluster_time(&ct);
        }
    }
    if let Ok(op_time) = reply.get_timestamp("operationTime") {
        if let Some(session) = session {
            session.advance_operation_time(op_time);
        }
    }
    if let Some(session) = session {
        session.advance_transaction_state();
    }

    let ok = reply.get_f64("ok").unwrap_or(1.0);
    if ok != 1.0 {
        let command_error = CommandError {
            code: reply.get_i32("code").unwrap_or(-1),
            code_name: reply.get_str("codeName").unwrap_or_default().to_string(),
            message: reply.get_str("errmsg").unwrap_or("command failed").to_string(),
        };
        let labels = reply
            .get_array("errorLabels")
            .ok()
            .map(|arr| arr.iter().filter_map(|b| b.as_str().map(str::to_string)).collect())
            .unwrap_or_else(Vec::new);
        let mut err = Error::new(ErrorKind::Command(command_error), labels);
        if let Some(session) = session {
            if session.in_transaction() {
                err.add_label(crate::error::TRANSIENT_TRANSACTION_ERROR);
            }
        }
        return Err(err);
    }

    Ok(CommandResponse { body: reply })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::{Acknowledgment, ServerAddress};
    use bson::{doc, Timestamp};
    use std::sync::Arc;

    fn dummy_topology() -> Topology {
        let options = Arc::new(
            crate::options::ClientOptions::builder()
                .hosts(vec![ServerAddress::Tcp { host: "h".into(), port: 27017 }])
                .build(),
        );
        Topology::new(options, None, None, None)
    }

    #[test]
    fn field_order_matches_byte_comparable_invariant() {
        let topology = dummy_topology();
        topology
            .cluster_clock()
            .advance(ClusterTime(doc! { "clusterTime": Timestamp { time: 1, increment: 0 } }));

        let mut session = ClientSession::new(false);
        session.start_transaction();
        session.increment_txn_number();

        let read_concern = ReadConcern { level: "majority".into() };
        let op = RunCommand::new("test", doc! { "find": "coll", "filter": {} })
            .with_max_time(Duration::from_millis(1000));

        let command = build_command_document(
            &topology,
            &SelectionCriteria::write(),
            Some(&session),
            None,
            Some(&read_concern),
            &op,
        );

        let keys: Vec<&str> = command.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "find",
                "filter",
                "$db",
                "lsid",
                "txnNumber",
                "startTransaction",
                "autocommit",
                "readConcern",
                "$clusterTime",
                "maxTimeMS",
            ]
        );
    }

    #[test]
    fn write_concern_serializes_majority() {
        let wc = WriteConcern {
            w: Some(Acknowledgment::Majority),
            w_timeout: None,
            journal: None,
        };
        let bson = bson::to_bson(&wc).unwrap();
        assert_eq!(bson.as_document().unwrap().get_str("w").unwrap(), "majority");
    }
}
