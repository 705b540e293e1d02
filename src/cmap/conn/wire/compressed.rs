//! `OP_COMPRESSED` framing: wraps any other opcode's body (§4.1, §6).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::header::{Header, OpCode, HEADER_LENGTH};
use crate::{
    compression::{compress, decompress, Compressor},
    error::{ErrorKind, Result},
};

/// The decoded fixed fields of an `OP_COMPRESSED` frame, with the compressed payload still
/// opaque — the caller decompresses once it knows which compressor id was negotiated on read,
/// since the original message bytes must be handed back to the same opcode parser that would
/// have handled them uncompressed.
pub(crate) struct CompressedFrame {
    pub(crate) original_opcode: OpCode,
    pub(crate) uncompressed: Vec<u8>,
}

pub(crate) async fn write_compressed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request_id: i32,
    original_opcode: OpCode,
    uncompressed_body: &[u8],
    compressor: Compressor,
) -> Result<()> {
    let compressed = compress(uncompressed_body, compressor)?;

    let mut body = Vec::with_capacity(9 + compressed.len());
    body.extend_from_slice(&(original_opcode as i32).to_le_bytes());
    body.extend_from_slice(&(uncompressed_body.len() as i32).to_le_bytes());
    body.push(compressor.id());
    body.extend_from_slice(&compressed);

    let length = (HEADER_LENGTH + body.len()) as i32;
    let header = Header::new(length, request_id, 0, OpCode::Compressed);
    let mut full = Vec::with_capacity(length as usize);
    full.extend_from_slice(&header.to_bytes());
    full.extend_from_slice(&body);
    writer.write_all(&full).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_compressed<R: AsyncRead + Unpin>(
    reader: &mut R,
    header: Header,
) -> Result<CompressedFrame> {
    let body_len = header.length as usize - HEADER_LENGTH;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    if body.len() < 9 {
        return Err(ErrorKind::InvalidResponse {
            message: "OP_COMPRESSED body shorter than its fixed fields".into(),
        }
        .into());
    }
    let original_opcode = OpCode::from_i32(i32::from_le_bytes(body[0..4].try_into().unwrap()))?;
    let uncompressed_size = i32::from_le_bytes(body[4..8].try_into().unwrap()) as usize;
    let compressor_id = body[8];
    let compressor = Compressor::from_id(compressor_id)?;
    let uncompressed = decompress(&body[9..], compressor, uncompressed_size)?;
    Ok(CompressedFrame {
        original_opcode,
        uncompressed,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cmap::conn::wire::header::Header as H;

    #[tokio::test]
    async fn roundtrips_noop_compression() {
        let body = b"fake OP_MSG body".to_vec();
        let mut buf = Vec::new();
        write_compressed(&mut buf, 5, OpCode::Message, &body, Compressor::Noop)
            .await
            .unwrap();
        let header = H::from_bytes(&buf[..HEADER_LENGTH]).unwrap();
        let mut cursor = std::io::Cursor::new(&buf[HEADER_LENGTH..]);
        let frame = read_compressed(&mut cursor, header).await.unwrap();
        assert_eq!(frame.original_opcode, OpCode::Message);
        assert_eq!(frame.uncompressed, body);
    }
}
