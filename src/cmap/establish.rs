//! Runs the handshake (§4.4) on a freshly-dialed [`Connection`], producing a
//! [`ServerDescription`] and populating the connection's negotiated wire version/compressor.

use std::time::{Duration, Instant};

use bson::Document;

use super::conn::{Connection, StreamDescription};
use crate::{
    bson_util,
    compression::{negotiate, Compressor},
    error::{Error, ErrorKind, Result},
    hello::{build_hello_command, build_client_metadata, DriverMetadata, OsMetadata},
    options::{ClientOptions, Credential, ServerAddress},
    sdam::description::{ServerDescription, ServerType, TopologyVersion},
};

/// Whether to address the server as `hello` (OP_MSG) or the legacy `isMaster`. Per §4.4 step 1,
/// `hello` is used for `LoadBalanced` topologies, when a Server-API version was declared, or once
/// a previous `hello` reply has said `helloOk: true`; a fresh, never-contacted address starts
/// with the legacy command so it is discoverable even against very old servers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum HandshakeProtocol {
    Hello,
    LegacyIsMaster,
}

pub(crate) struct Handshaker {
    pub(crate) driver_metadata: DriverMetadata,
    pub(crate) os_metadata: OsMetadata,
    pub(crate) platform: String,
    pub(crate) compressors: Vec<Compressor>,
}

impl Handshaker {
    pub(crate) fn new(compressors: Vec<Compressor>) -> Self {
        Handshaker {
            driver_metadata: DriverMetadata {
                name: "mongodb-core-driver".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            os_metadata: OsMetadata {
                os_type: std::env::consts::OS.to_string(),
                architecture: std::env::consts::ARCH.to_string(),
            },
            platform: format!("rustc (unknown version) / {}", std::env::consts::OS),
            compressors,
        }
    }

    /// Runs the handshake on `conn`, returning the resulting [`ServerDescription`]. `conn`'s
    /// `stream_description` is updated with the negotiated compressor and max wire version as a
    /// side effect so subsequent traffic on the same connection uses them (§4.4 step 5).
    pub(crate) async fn handshake(
        &self,
        conn: &mut Connection,
        options: &ClientOptions,
        protocol: HandshakeProtocol,
        credential: Option<&Credential>,
    ) -> Result<ServerDescription> {
        let env = crate::hello::detect_faas_environment(|k| std::env::var(k).ok()).map(|(_, doc)| doc);
        let metadata = build_client_metadata(
            options.app_name.as_deref(),
            &self.driver_metadata,
            &self.os_metadata,
            &self.platform,
            env,
        )?;

        let use_hello = protocol == HandshakeProtocol::Hello;
        let command = build_hello_command(options, use_hello, credential, &self.compressors, metadata)?;

        let start = Instant::now();
        let raw = bson_util::to_raw_document_buf(&command)?;
        conn.write_command(raw, Some(options.connect_timeout)).await?;
        let response = conn.read_message(Some(options.connect_timeout)).await?;
        let elapsed = start.elapsed();

        let reply: Document = bson::from_slice(response.command_document()?.as_bytes())
            .map_err(Error::from)?;

        let ok = reply.get_f64("ok").unwrap_or(0.0);
        if ok != 1.0 {
            return Err(ErrorKind::Command(crate::error::CommandError {
                code: reply.get_i32("code").unwrap_or(-1),
                code_name: reply.get_str("codeName").unwrap_or_default().to_string(),
                message: reply.get_str("errmsg").unwrap_or("handshake failed").to_string(),
            })
            .into());
        }

        let mut description = parse_hello_reply(conn.address.clone(), &reply)?;
        description.average_rtt = Some(elapsed);
        description.last_update_time = Some(Instant::now());

        conn.stream_description = StreamDescription {
            max_wire_version: description.max_wire_version,
            compressor: negotiate(&self.compressors, &description.compression),
            server_connection_id: reply.get_i64("connectionId").ok(),
        };

        Ok(description)
    }
}

fn parse_hello_reply(address: ServerAddress, reply: &Document) -> Result<ServerDescription> {
    let mut description = ServerDescription::unknown(address);

    description.server_type = classify_server_type(reply);
    description.min_wire_version = reply.get_i32("minWireVersion").unwrap_or(0);
    description.max_wire_version = reply.get_i32("maxWireVersion").unwrap_or(0);
    description.max_bson_object_size = reply.get_i64("maxBsonObjectSize").unwrap_or(16 * 1024 * 1024);
    description.max_message_size_bytes =
        reply.get_i64("maxMessageSizeBytes").unwrap_or(48 * 1024 * 1024);
    description.max_write_batch_size = reply.get_i64("maxWriteBatchSize").unwrap_or(100_000);
    description.hello_ok = reply.get_bool("helloOk").unwrap_or(false);
    description.logical_session_timeout_minutes = reply.get_i64("logicalSessionTimeoutMinutes").ok();

    description.set_name = reply.get_str("setName").ok().map(str::to_string);
    description.set_version = reply.get_i32("setVersion").ok();
    description.election_id = reply.get_object_id("electionId").ok();
    description.primary = reply
        .get_str("primary")
        .ok()
        .map(ServerAddress::parse)
        .transpose()?;
    description.hosts = parse_address_array(reply, "hosts")?;
    description.passives = parse_address_array(reply, "passives")?;
    description.arbiters = parse_address_array(reply, "arbiters")?;
    description.me = reply.get_str("me").ok().map(ServerAddress::parse).transpose()?;

    description.sasl_supported_mechs = reply
        .get_array("saslSupportedMechs")
        .ok()
        .map(|arr| arr.iter().filter_map(|b| b.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    description.compression = reply
        .get_array("compression")
        .ok()
        .map(|arr| arr.iter().filter_map(|b| b.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    if let Ok(tv) = reply.get_document("topologyVersion") {
        if let (Ok(process_id), Ok(counter)) = (tv.get_object_id("processId"), tv.get_i64("counter")) {
            description.topology_version = Some(TopologyVersion { process_id, counter });
        }
    }

    Ok(description)
}

fn classify_server_type(reply: &Document) -> ServerType {
    if reply.get_bool("isreplicaset").unwrap_or(false) {
        return ServerType::RSGhost;
    }
    if reply.get_str("msg").ok() == Some("isdbgrid") {
        return ServerType::Mongos;
    }
    if reply.get_str("setName").is_ok() {
        if reply.get_bool("ismaster").unwrap_or(false) || reply.get_bool("isWritablePrimary").unwrap_or(false) {
            return ServerType::RSPrimary;
        }
        if reply.get_bool("secondary").unwrap_or(false) {
            return ServerType::RSSecondary;
        }
        if reply.get_bool("arbiterOnly").unwrap_or(false) {
            return ServerType::RSArbiter;
        }
        return ServerType::RSOther;
    }
    ServerType::Standalone
}

fn parse_address_array(reply: &Document, key: &str) -> Result<Vec<ServerAddress>> {
    Ok(reply
        .get_array(key)
        .ok()
        .map(|arr| arr.iter().filter_map(|b| b.as_str()).map(ServerAddress::parse).collect::<Result<Vec<_>>>())
        .transpose()?
        .unwrap_or_default())
}

pub(crate) const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);
