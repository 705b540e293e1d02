//! `OP_QUERY` / `OP_REPLY` — retained only for the legacy handshake fallback (§4.4 step 1, §9).
//! No other operation in this crate is permitted to use these opcodes.

use bitflags::bitflags;
use bson::{RawDocument, RawDocumentBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode, HEADER_LENGTH},
    util::write_cstring,
};
use crate::error::{ErrorKind, Result};

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct QueryFlags: i32 {
        const SLAVE_OK = 1 << 2;
    }
}

/// A legacy `OP_QUERY`, built only for the `admin.$cmd` legacy handshake (§4.4 step 1).
#[derive(Clone, Debug)]
pub struct OpQuery {
    pub request_id: i32,
    pub flags: QueryFlags,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: RawDocumentBuf,
}

impl OpQuery {
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.flags.bits().to_le_bytes());
        write_cstring(&mut body, &self.full_collection_name)?;
        body.extend_from_slice(&self.number_to_skip.to_le_bytes());
        body.extend_from_slice(&self.number_to_return.to_le_bytes());
        body.extend_from_slice(self.query.as_bytes());

        let length = (HEADER_LENGTH + body.len()) as i32;
        let header = Header::new(length, self.request_id, 0, OpCode::Query);
        let mut full = Vec::with_capacity(length as usize);
        full.extend_from_slice(&header.to_bytes());
        full.extend_from_slice(&body);
        writer.write_all(&full).await?;
        writer.flush().await?;
        Ok(())
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ReplyFlags: i32 {
        const CURSOR_NOT_FOUND = 1 << 0;
        const QUERY_FAILURE    = 1 << 1;
        const AWAIT_CAPABLE    = 1 << 3;
    }
}

/// A legacy `OP_REPLY`, the only valid response to an `OP_QUERY` legacy handshake.
#[derive(Clone, Debug)]
pub struct OpReply {
    pub response_to: i32,
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<RawDocumentBuf>,
}

impl OpReply {
    /// The first (and, for a handshake reply, only) document in the reply.
    pub fn first_document(&self) -> Result<&RawDocumentBuf> {
        self.documents.first().ok_or_else(|| {
            ErrorKind::InvalidResponse {
                message: "OP_REPLY contained no documents".into(),
            }
            .into()
        })
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, header: Header) -> Result<Self> {
        let body_len = header.length as usize - HEADER_LENGTH;
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;
        if body.len() < 20 {
            return Err(ErrorKind::InvalidResponse {
                message: "OP_REPLY body shorter than its fixed fields".into(),
            }
            .into());
        }
        let flags = ReplyFlags::from_bits_truncate(i32::from_le_bytes(body[0..4].try_into().unwrap()));
        let cursor_id = i64::from_le_bytes(body[4..12].try_into().unwrap());
        let starting_from = i32::from_le_bytes(body[12..16].try_into().unwrap());
        let number_returned = i32::from_le_bytes(body[16..20].try_into().unwrap());

        if flags.contains(ReplyFlags::QUERY_FAILURE) {
            let doc = RawDocument::from_bytes(&body[20..]).map_err(|e| ErrorKind::InvalidResponse {
                message: format!("malformed OP_REPLY error document: {e}"),
            })?;
            return Err(ErrorKind::InvalidResponse {
                message: format!("legacy query failed: {doc:?}"),
            }
            .into());
        }

        let mut documents = Vec::with_capacity(number_returned.max(0) as usize);
        let mut offset = 20;
        while offset < body.len() {
            let doc = RawDocument::from_bytes(&body[offset..]).map_err(|e| ErrorKind::InvalidResponse {
                message: format!("malformed document in OP_REPLY: {e}"),
            })?;
            offset += doc.as_bytes().len();
            documents.push(doc.to_owned());
        }

        Ok(OpReply {
            response_to: header.response_to,
            flags,
            cursor_id,
            starting_from,
            documents,
        })
    }
}
