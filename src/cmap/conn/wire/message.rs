//! `OP_MSG` framing (§4.1, §6) — the only opcode used for post-handshake traffic.

use bitflags::bitflags;
use bson::{RawDocument, RawDocumentBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode, HEADER_LENGTH},
    util::{crc32, read_cstring, write_cstring},
};
use crate::error::{ErrorKind, Result};

bitflags! {
    /// Flag bits carried in the 4 bytes immediately following the header in an `OP_MSG` (§4.1).
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 1 << 0;
        const MORE_TO_COME     = 1 << 1;
        const EXHAUST_ALLOWED  = 1 << 16;
    }
}

/// One section of an `OP_MSG` body. A message always has exactly one Type-0 section (the command
/// document itself) and may have any number of Type-1 sections (document sequences, used by bulk
/// write helpers the CRUD layer above this crate would build).
#[derive(Clone, Debug)]
pub enum MessageSection {
    Single(RawDocumentBuf),
    Sequence {
        identifier: String,
        documents: Vec<RawDocumentBuf>,
    },
}

impl MessageSection {
    fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            MessageSection::Single(doc) => {
                buf.push(0);
                buf.extend_from_slice(doc.as_bytes());
            }
            MessageSection::Sequence { identifier, documents } => {
                buf.push(1);
                let size_pos = buf.len();
                buf.extend_from_slice(&0i32.to_le_bytes());
                write_cstring(buf, identifier).expect("identifier validated at construction");
                for doc in documents {
                    buf.extend_from_slice(doc.as_bytes());
                }
                let size = (buf.len() - size_pos) as i32;
                buf[size_pos..size_pos + 4].copy_from_slice(&size.to_le_bytes());
            }
        }
    }
}

/// A fully-decoded `OP_MSG` message, independent of which direction it traveled.
#[derive(Clone, Debug)]
pub struct Message {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: MessageFlags,
    pub sections: Vec<MessageSection>,
}

impl Message {
    /// Builds a request message wrapping a single command document, the shape every operation in
    /// this crate sends (§4.8).
    pub fn with_command(request_id: i32, command: RawDocumentBuf) -> Self {
        Self {
            request_id,
            response_to: 0,
            flags: MessageFlags::empty(),
            sections: vec![MessageSection::Single(command)],
        }
    }

    /// The command document carried in this message's Type-0 section, per the command-naming
    /// rule of §4.1.
    pub fn command_document(&self) -> Result<&RawDocument> {
        self.sections
            .iter()
            .find_map(|s| match s {
                MessageSection::Single(doc) => Some(doc.as_ref()),
                _ => None,
            })
            .ok_or_else(|| {
                ErrorKind::InvalidResponse {
                    message: "OP_MSG had no Type-0 section".into(),
                }
                .into()
            })
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let checksum_present = self.flags.contains(MessageFlags::CHECKSUM_PRESENT);
        body.extend_from_slice(&self.flags.bits().to_le_bytes());
        for section in &self.sections {
            section.write_to(&mut body);
        }
        if checksum_present {
            let checksum = crc32(&body);
            body.extend_from_slice(&checksum.to_le_bytes());
        }
        body
    }

    /// Serializes this message, framed with its header, onto `writer`.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let body = self.encode_body();
        let length = (HEADER_LENGTH + body.len()) as i32;
        let header = Header::new(length, self.request_id, self.response_to, OpCode::Message);
        let mut full = Vec::with_capacity(length as usize);
        full.extend_from_slice(&header.to_bytes());
        full.extend_from_slice(&body);
        writer.write_all(&full).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads an `OP_MSG` body (the part after the header, which the caller has already consumed)
    /// from `reader`.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, header: Header) -> Result<Self> {
        let body_len = header.length as usize - HEADER_LENGTH;
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;

        if body.len() < 4 {
            return Err(ErrorKind::InvalidResponse {
                message: "OP_MSG body missing flag bits".into(),
            }
            .into());
        }
        let flags = MessageFlags::from_bits_truncate(u32::from_le_bytes(body[0..4].try_into().unwrap()));
        let checksum_present = flags.contains(MessageFlags::CHECKSUM_PRESENT);

        let sections_end = if checksum_present {
            if body.len() < 4 {
                return Err(ErrorKind::InvalidResponse {
                    message: "OP_MSG declared a checksum but the body was too short".into(),
                }
                .into());
            }
            let declared: u32 = u32::from_le_bytes(body[body.len() - 4..].try_into().unwrap());
            let computed = crc32(&body[..body.len() - 4]);
            if declared != computed {
                return Err(ErrorKind::InvalidResponse {
                    message: format!(
                        "OP_MSG checksum mismatch: declared {declared:#x}, computed {computed:#x}"
                    ),
                }
                .into());
            }
            body.len() - 4
        } else {
            body.len()
        };

        let mut offset = 4;
        let mut sections = Vec::new();
        while offset < sections_end {
            let kind = body[offset];
            offset += 1;
            match kind {
                0 => {
                    let doc = RawDocument::from_bytes(&body[offset..sections_end])
                        .map_err(|e| ErrorKind::InvalidResponse {
                            message: format!("malformed Type-0 section document: {e}"),
                        })?;
                    offset += doc.as_bytes().len();
                    sections.push(MessageSection::Single(doc.to_owned()));
                }
                1 => {
                    if offset + 4 > sections_end {
                        return Err(ErrorKind::InvalidResponse {
                            message: "truncated Type-1 section size".into(),
                        }
                        .into());
                    }
                    let size = i32::from_le_bytes(body[offset..offset + 4].try_into().unwrap()) as usize;
                    let section_end = offset + size;
                    if section_end > sections_end {
                        return Err(ErrorKind::InvalidResponse {
                            message: "Type-1 section size extends past message body".into(),
                        }
                        .into());
                    }
                    let mut cursor = offset + 4;
                    let identifier = read_cstring(&body, &mut cursor)?;
                    let mut documents = Vec::new();
                    while cursor < section_end {
                        let doc = RawDocument::from_bytes(&body[cursor..section_end])
                            .map_err(|e| ErrorKind::InvalidResponse {
                                message: format!("malformed document in Type-1 section: {e}"),
                            })?;
                        cursor += doc.as_bytes().len();
                        documents.push(doc.to_owned());
                    }
                    offset = section_end;
                    sections.push(MessageSection::Sequence { identifier, documents });
                }
                other => {
                    return Err(ErrorKind::InvalidResponse {
                        message: format!("unrecognized OP_MSG section kind {other}"),
                    }
                    .into())
                }
            }
        }

        Ok(Message {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            sections,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn roundtrips_single_section() {
        let command = bson::to_raw_document_buf(&doc! { "ping": 1 }).unwrap();
        let msg = Message::with_command(42, command);
        let mut buf = Vec::new();
        msg.write_to(&mut buf).await.unwrap();

        let header = Header::from_bytes(&buf[..HEADER_LENGTH]).unwrap();
        let mut cursor = std::io::Cursor::new(&buf[HEADER_LENGTH..]);
        let decoded = Message::read_from(&mut cursor, header).await.unwrap();
        assert_eq!(decoded.request_id, 42);
        let doc = decoded.command_document().unwrap();
        assert_eq!(doc.get_i32("ping").unwrap(), 1);
    }

    #[tokio::test]
    async fn roundtrips_with_checksum() {
        let command = bson::to_raw_document_buf(&doc! { "ping": 1 }).unwrap();
        let mut msg = Message::with_command(1, command);
        msg.flags |= MessageFlags::CHECKSUM_PRESENT;
        let mut buf = Vec::new();
        msg.write_to(&mut buf).await.unwrap();

        let header = Header::from_bytes(&buf[..HEADER_LENGTH]).unwrap();
        let mut cursor = std::io::Cursor::new(&buf[HEADER_LENGTH..]);
        let decoded = Message::read_from(&mut cursor, header).await.unwrap();
        assert!(decoded.flags.contains(MessageFlags::CHECKSUM_PRESENT));
    }

    #[tokio::test]
    async fn rejects_corrupted_checksum() {
        let command = bson::to_raw_document_buf(&doc! { "ping": 1 }).unwrap();
        let mut msg = Message::with_command(1, command);
        msg.flags |= MessageFlags::CHECKSUM_PRESENT;
        let mut buf = Vec::new();
        msg.write_to(&mut buf).await.unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let header = Header::from_bytes(&buf[..HEADER_LENGTH]).unwrap();
        let mut cursor = std::io::Cursor::new(&buf[HEADER_LENGTH..]);
        assert!(Message::read_from(&mut cursor, header).await.is_err());
    }

    #[tokio::test]
    async fn roundtrips_document_sequence() {
        let command = bson::to_raw_document_buf(&doc! { "insert": "coll" }).unwrap();
        let docs = vec![
            bson::to_raw_document_buf(&doc! { "_id": 1 }).unwrap(),
            bson::to_raw_document_buf(&doc! { "_id": 2 }).unwrap(),
        ];
        let msg = Message {
            request_id: 1,
            response_to: 0,
            flags: MessageFlags::empty(),
            sections: vec![
                MessageSection::Single(command),
                MessageSection::Sequence {
                    identifier: "documents".into(),
                    documents: docs,
                },
            ],
        };
        let mut buf = Vec::new();
        msg.write_to(&mut buf).await.unwrap();
        let header = Header::from_bytes(&buf[..HEADER_LENGTH]).unwrap();
        let mut cursor = std::io::Cursor::new(&buf[HEADER_LENGTH..]);
        let decoded = Message::read_from(&mut cursor, header).await.unwrap();
        assert_eq!(decoded.sections.len(), 2);
    }
}
