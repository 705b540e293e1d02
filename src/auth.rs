//! The opaque `saslStart`/`saslContinue` conversation driver (§4.9). The concrete mechanisms
//! (SCRAM, X.509, GSSAPI, MONGODB-AWS, MONGODB-OIDC) carry no cryptographic logic here; a caller
//! supplies the conversation's byte-level steps through [`SaslStep`] and this module only drives
//! the command loop and parses the server's replies.

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document};

use crate::{
    bson_util,
    cmap::Connection,
    error::{Error, Result},
};

const SCRAM_SHA_1_STR: &str = "SCRAM-SHA-1";
const SCRAM_SHA_256_STR: &str = "SCRAM-SHA-256";
const MONGODB_X509_STR: &str = "MONGODB-X509";
const GSSAPI_STR: &str = "GSSAPI";
const MONGODB_AWS_STR: &str = "MONGODB-AWS";
const MONGODB_OIDC_STR: &str = "MONGODB-OIDC";
const PLAIN_STR: &str = "PLAIN";

/// Names an authentication mechanism for `saslSupportedMechs` negotiation and for shaping
/// `saslStart`/`saslContinue` commands. The mechanisms' actual cryptographic conversations are
/// out of scope (§1 Non-goals); only the naming and wire-level shape live here.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AuthMechanism {
    ScramSha1,
    ScramSha256,
    MongoDbX509,
    Gssapi,
    MongoDbAws,
    MongoDbOidc,
    Plain,
}

impl AuthMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => SCRAM_SHA_1_STR,
            AuthMechanism::ScramSha256 => SCRAM_SHA_256_STR,
            AuthMechanism::MongoDbX509 => MONGODB_X509_STR,
            AuthMechanism::Gssapi => GSSAPI_STR,
            AuthMechanism::MongoDbAws => MONGODB_AWS_STR,
            AuthMechanism::MongoDbOidc => MONGODB_OIDC_STR,
            AuthMechanism::Plain => PLAIN_STR,
        }
    }

    /// The mechanism a `hello` reply's `saslSupportedMechs` negotiates to when no mechanism was
    /// configured explicitly: SCRAM-SHA-256 if advertised, else SCRAM-SHA-1 (§4.4, §4.9).
    pub fn negotiate(sasl_supported_mechs: &[String]) -> Self {
        if sasl_supported_mechs.iter().any(|m| m == SCRAM_SHA_256_STR) {
            AuthMechanism::ScramSha256
        } else {
            AuthMechanism::ScramSha1
        }
    }
}

/// One step of a SASL conversation. The implementation (supplied by the caller, or by a canned
/// sequence in tests) owns the mechanism's cryptographic state; this trait only exposes the
/// byte-in/byte-out contract the wire loop needs.
pub trait SaslStep {
    /// Produces the next outgoing payload given the server's last payload (empty for the very
    /// first call). Returns `Ok(None)` once the client side of the conversation has nothing
    /// further to send.
    fn step(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>>;
}

fn sasl_start_command(source: &str, mechanism: AuthMechanism, payload: Vec<u8>) -> Document {
    let mut body = doc! {
        "saslStart": 1,
        "$db": source,
        "mechanism": mechanism.as_str(),
        "payload": Binary { subtype: BinarySubtype::Generic, bytes: payload },
    };
    if matches!(mechanism, AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256) {
        body.insert("options", doc! { "skipEmptyExchange": true });
    }
    body
}

fn sasl_continue_command(source: &str, conversation_id: Bson, payload: Vec<u8>) -> Document {
    doc! {
        "saslContinue": 1,
        "$db": source,
        "conversationId": conversation_id,
        "payload": Binary { subtype: BinarySubtype::Generic, bytes: payload },
    }
}

struct SaslResponse {
    conversation_id: Bson,
    done: bool,
    payload: Vec<u8>,
}

impl SaslResponse {
    fn parse(mechanism: AuthMechanism, mut response: Document) -> Result<Self> {
        let ok = response.get_f64("ok").unwrap_or(
            response.get_i32("ok").map(f64::from).unwrap_or(1.0),
        );
        if ok != 1.0 {
            let message = response
                .get_str("errmsg")
                .unwrap_or("authentication failure")
                .to_string();
            return Err(Error::authentication(format!(
                "{}: {message}",
                mechanism.as_str()
            )));
        }

        let conversation_id = response.remove("conversationId").ok_or_else(|| {
            Error::authentication(format!(
                "{}: response missing conversationId",
                mechanism.as_str()
            ))
        })?;
        let done = response
            .remove("done")
            .and_then(|b| b.as_bool())
            .ok_or_else(|| {
                Error::authentication(format!("{}: response missing done", mechanism.as_str()))
            })?;
        let payload = match response.remove("payload") {
            Some(Bson::Binary(bin)) => bin.bytes,
            _ => {
                return Err(Error::authentication(format!(
                    "{}: response missing payload",
                    mechanism.as_str()
                )))
            }
        };

        Ok(SaslResponse {
            conversation_id,
            done,
            payload,
        })
    }
}

/// Drives a `saslStart`/`saslContinue` conversation over `conn` to completion, per §4.9. `steps`
/// supplies each outgoing payload from the previous incoming one; the loop itself only knows how
/// to build the commands and recognize `done: true`.
pub async fn conduct_sasl_conversation(
    conn: &mut Connection,
    source: &str,
    mechanism: AuthMechanism,
    mut steps: impl SaslStep,
) -> Result<Document> {
    let first_payload = steps.step(&[])?.unwrap_or_default();
    let start = sasl_start_command(source, mechanism, first_payload);
    let raw = bson_util::to_raw_document_buf(&start)?;
    conn.write_command(raw, None).await?;
    let response = conn.read_message(None).await?;
    let reply: Document = bson::from_slice(response.command_document()?.as_bytes())?;
    let mut sasl_response = SaslResponse::parse(mechanism, reply)?;

    loop {
        if sasl_response.done {
            return Ok(doc! { "conversationId": sasl_response.conversation_id, "done": true });
        }

        let next_payload = match steps.step(&sasl_response.payload)? {
            Some(payload) => payload,
            None => {
                // The client has nothing further to send but the server has not said `done`;
                // send an empty continue to let it finish the conversation on its side.
                Vec::new()
            }
        };

        let cont = sasl_continue_command(
            source,
            sasl_response.conversation_id.clone(),
            next_payload,
        );
        let raw = bson_util::to_raw_document_buf(&cont)?;
        conn.write_command(raw, None).await?;
        let response = conn.read_message(None).await?;
        let reply: Document = bson::from_slice(response.command_document()?.as_bytes())?;
        sasl_response = SaslResponse::parse(mechanism, reply)?;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negotiate_prefers_sha256_when_advertised() {
        let mechs = vec!["SCRAM-SHA-1".to_string(), "SCRAM-SHA-256".to_string()];
        assert_eq!(AuthMechanism::negotiate(&mechs), AuthMechanism::ScramSha256);
    }

    #[test]
    fn negotiate_falls_back_to_sha1() {
        let mechs = vec!["SCRAM-SHA-1".to_string()];
        assert_eq!(AuthMechanism::negotiate(&mechs), AuthMechanism::ScramSha1);
    }

    #[test]
    fn sasl_response_rejects_ok_zero() {
        let doc = doc! { "ok": 0.0, "errmsg": "bad credentials" };
        let err = SaslResponse::parse(AuthMechanism::ScramSha256, doc).unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::Authentication { .. }));
    }

    #[test]
    fn sasl_response_parses_done_conversation() {
        let doc = doc! {
            "ok": 1.0,
            "conversationId": 1,
            "done": true,
            "payload": Binary { subtype: BinarySubtype::Generic, bytes: vec![] },
        };
        let response = SaslResponse::parse(AuthMechanism::ScramSha256, doc).unwrap();
        assert!(response.done);
    }
}
