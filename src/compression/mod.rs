//! Wire-level message compression (§4.1).
//!
//! A `Connection` negotiates a compressor once during the handshake and reuses it for every
//! outbound command whose name is not in [`NON_COMPRESSIBLE_COMMANDS`]. Inbound `OP_COMPRESSED`
//! frames always decompress using the `compressorId` carried in the frame, independent of what
//! was negotiated, because the server is free to pick any algorithm it advertised.

mod compress;
mod decompress;

pub(crate) use compress::compress;
pub(crate) use decompress::decompress;

use crate::error::{ErrorKind, Result};

/// Commands that must never be sent compressed, because compressing the handshake or an
/// authentication step could defeat the security properties the server relies on (§4.1).
pub const NON_COMPRESSIBLE_COMMANDS: &[&str] = &[
    "ismaster",
    "hello",
    "saslstart",
    "saslcontinue",
    "getnonce",
    "authenticate",
    "createuser",
    "updateuser",
    "copydbsaslstart",
    "copydbgetnonce",
    "copydb",
];

pub(crate) fn is_compressible(command_name: &str) -> bool {
    !NON_COMPRESSIBLE_COMMANDS.contains(&command_name.to_ascii_lowercase().as_str())
}

/// The wire-level identifier for a compression algorithm, as carried in `OP_COMPRESSED` and in
/// the `compression` array of a `hello` reply (§3 ServerDescription.compression).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Compressor {
    Noop,
    Snappy,
    Zlib { level: Option<i32> },
    Zstd { level: Option<i32> },
}

impl Compressor {
    pub fn id(&self) -> u8 {
        match self {
            Compressor::Noop => 0,
            Compressor::Snappy => 1,
            Compressor::Zlib { .. } => 2,
            Compressor::Zstd { .. } => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compressor::Noop => "noop",
            Compressor::Snappy => "snappy",
            Compressor::Zlib { .. } => "zlib",
            Compressor::Zstd { .. } => "zstd",
        }
    }

    pub fn from_id(id: u8) -> Result<Self> {
        Ok(match id {
            0 => Compressor::Noop,
            1 => Compressor::Snappy,
            2 => Compressor::Zlib { level: None },
            3 => Compressor::Zstd { level: None },
            other => {
                return Err(ErrorKind::InvalidResponse {
                    message: format!("unrecognized compressorId {other}"),
                }
                .into())
            }
        })
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "noop" => Compressor::Noop,
            "snappy" => Compressor::Snappy,
            "zlib" => Compressor::Zlib { level: None },
            "zstd" => Compressor::Zstd { level: None },
            other => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("unrecognized compressor name {other}"),
                }
                .into())
            }
        })
    }
}

/// Picks the first entry of `preferred` (the client's configured order) that also appears in
/// `advertised` (the server's `compression` array), matching the teacher's negotiation rule.
pub(crate) fn negotiate(preferred: &[Compressor], advertised: &[String]) -> Option<Compressor> {
    preferred
        .iter()
        .find(|c| advertised.iter().any(|name| name == c.name()))
        .copied()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn non_compressible_commands_are_case_insensitive() {
        assert!(!is_compressible("Hello"));
        assert!(!is_compressible("SASLSTART"));
        assert!(is_compressible("find"));
    }

    #[test]
    fn negotiation_prefers_client_order() {
        let preferred = [Compressor::Zstd { level: None }, Compressor::Snappy];
        let advertised = vec!["snappy".to_string(), "zstd".to_string()];
        assert_eq!(negotiate(&preferred, &advertised), Some(Compressor::Zstd { level: None }));
    }

    #[test]
    fn negotiation_is_none_without_overlap() {
        let preferred = [Compressor::Zstd { level: None }];
        let advertised = vec!["snappy".to_string()];
        assert_eq!(negotiate(&preferred, &advertised), None);
    }
}
