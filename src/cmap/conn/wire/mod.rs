//! The wire protocol codec (§4.1): header framing, opcodes, and compression adapters.

mod compressed;
pub(crate) mod header;
pub(crate) mod message;
pub(crate) mod query;
mod util;

use bson::RawDocumentBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

pub use message::{Message, MessageFlags, MessageSection};
pub use query::{OpQuery, OpReply, QueryFlags, ReplyFlags};

use self::header::{Header, OpCode, HEADER_LENGTH};
use crate::{
    bson_util::first_key_raw,
    compression::{is_compressible, Compressor},
    error::{ErrorKind, Result},
};

/// The decoded result of reading one wire message off a socket, after transparently unwrapping
/// `OP_COMPRESSED` (§4.1: "Inbound OP_COMPRESSED is always decompressed").
#[derive(Debug)]
pub(crate) enum WireMessage {
    Msg(Message),
    Reply(OpReply),
}

impl WireMessage {
    /// Reads exactly one wire message from `reader`, decompressing transparently if the frame
    /// was `OP_COMPRESSED`.
    pub(crate) async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header_bytes = [0u8; HEADER_LENGTH];
        reader.read_exact(&mut header_bytes).await?;
        let header = Header::from_bytes(&header_bytes)?;

        match header.op_code {
            OpCode::Message => Ok(WireMessage::Msg(Message::read_from(reader, header).await?)),
            OpCode::Reply => Ok(WireMessage::Reply(OpReply::read_from(reader, header).await?)),
            OpCode::Compressed => {
                let frame = compressed::read_compressed(reader, header).await?;
                let mut cursor = std::io::Cursor::new(frame.uncompressed);
                let inner_header = Header::new(
                    (HEADER_LENGTH + cursor.get_ref().len()) as i32,
                    header.request_id,
                    header.response_to,
                    frame.original_opcode,
                );
                match frame.original_opcode {
                    OpCode::Message => {
                        Ok(WireMessage::Msg(Message::read_from(&mut cursor, inner_header).await?))
                    }
                    OpCode::Reply => {
                        Ok(WireMessage::Reply(OpReply::read_from(&mut cursor, inner_header).await?))
                    }
                    other => Err(ErrorKind::InvalidResponse {
                        message: format!("OP_COMPRESSED wrapped an unsupported opcode {other:?}"),
                    }
                    .into()),
                }
            }
            OpCode::Query => Err(ErrorKind::InvalidResponse {
                message: "received an OP_QUERY, which is only ever sent, never received".into(),
            }
            .into()),
        }
    }

    /// Writes `command` as an `OP_MSG`, compressing it first if `compressor` is set and the
    /// command name is not in the non-compressible set (§4.1).
    pub(crate) async fn write_command<W: AsyncWrite + Unpin>(
        writer: &mut W,
        request_id: i32,
        command: RawDocumentBuf,
        compressor: Option<Compressor>,
    ) -> Result<()> {
        let command_name = first_key_raw(&command)?;
        let message = Message::with_command(request_id, command);

        match compressor {
            Some(compressor) if is_compressible(&command_name) => {
                let mut uncompressed = Vec::new();
                message.write_to(&mut uncompressed).await?;
                let body = &uncompressed[HEADER_LENGTH..];
                compressed::write_compressed(writer, request_id, OpCode::Message, body, compressor)
                    .await
            }
            _ => message.write_to(writer).await,
        }
    }
}
