//! Small wire-codec helpers: CString read/write and the CRC32 checksum used by `OP_MSG`.

use crate::error::{ErrorKind, Result};

pub(crate) fn write_cstring(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(ErrorKind::InvalidArgument {
            message: "CStrings must not contain embedded NUL bytes".into(),
        }
        .into());
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

pub(crate) fn read_cstring(bytes: &[u8], offset: &mut usize) -> Result<String> {
    let nul = bytes[*offset..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ErrorKind::InvalidResponse {
            message: "unterminated CString in wire message".into(),
        })?;
    let s = std::str::from_utf8(&bytes[*offset..*offset + nul])
        .map_err(|e| ErrorKind::InvalidResponse {
            message: format!("CString was not valid UTF-8: {e}"),
        })?
        .to_string();
    *offset += nul + 1;
    Ok(s)
}

/// IEEE CRC-32, table-driven. `OP_MSG`'s optional checksum is specified to be this exact
/// polynomial, so a small self-contained implementation avoids pulling in a checksum crate the
/// rest of the stack has no other use for.
pub(crate) fn crc32(bytes: &[u8]) -> u32 {
    static TABLE: std::sync::OnceLock<[u32; 256]> = std::sync::OnceLock::new();
    let table = TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut c = i as u32;
            for _ in 0..8 {
                c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            }
            *entry = c;
        }
        table
    });
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in bytes {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = table[idx] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn crc32_matches_known_vector() {
        // Standard "123456789" CRC-32/ISO-HDLC test vector.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn cstring_roundtrips() {
        let mut buf = Vec::new();
        write_cstring(&mut buf, "admin.$cmd").unwrap();
        let mut offset = 0;
        assert_eq!(read_cstring(&buf, &mut offset).unwrap(), "admin.$cmd");
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn cstring_rejects_embedded_nul() {
        let mut buf = Vec::new();
        assert!(write_cstring(&mut buf, "a\0b").is_err());
    }
}
