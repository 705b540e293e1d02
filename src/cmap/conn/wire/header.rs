//! The 16-byte message header shared by every opcode (§4.1, §6).

use crate::error::{ErrorKind, Result};

pub(crate) const HEADER_LENGTH: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub(crate) enum OpCode {
    Reply = 1,
    Query = 2004,
    Compressed = 2012,
    Message = 2013,
}

impl OpCode {
    pub(crate) fn from_i32(value: i32) -> Result<Self> {
        Ok(match value {
            1 => OpCode::Reply,
            2004 => OpCode::Query,
            2012 => OpCode::Compressed,
            2013 => OpCode::Message,
            other => {
                return Err(ErrorKind::InvalidResponse {
                    message: format!("unsupported opcode {other}"),
                }
                .into())
            }
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) fn new(length: i32, request_id: i32, response_to: i32, op_code: OpCode) -> Self {
        Self {
            length,
            request_id,
            response_to,
            op_code,
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.op_code as i32).to_le_bytes());
        buf
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "expected at least {HEADER_LENGTH} bytes for a message header, got {}",
                    bytes.len()
                ),
            }
            .into());
        }
        let length = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let request_id = i32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let response_to = i32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let op_code = OpCode::from_i32(i32::from_le_bytes(bytes[12..16].try_into().unwrap()))?;
        if length < HEADER_LENGTH as i32 {
            return Err(ErrorKind::InvalidResponse {
                message: format!("message length {length} is smaller than the header itself"),
            }
            .into());
        }
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_roundtrips() {
        let header = Header::new(123, 7, 0, OpCode::Message);
        let bytes = header.to_bytes();
        let parsed = Header::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.length, 123);
        assert_eq!(parsed.request_id, 7);
        assert_eq!(parsed.response_to, 0);
        assert_eq!(parsed.op_code, OpCode::Message);
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(Header::from_bytes(&[0u8; 8]).is_err());
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut bytes = Header::new(16, 0, 0, OpCode::Message).to_bytes();
        bytes[12..16].copy_from_slice(&999i32.to_le_bytes());
        assert!(Header::from_bytes(&bytes).is_err());
    }
}
