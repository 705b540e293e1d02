use std::io::Write;

use super::Compressor;
use crate::error::{ErrorKind, Result};

pub(crate) fn compress(bytes: &[u8], compressor: Compressor) -> Result<Vec<u8>> {
    match compressor {
        Compressor::Noop => Ok(bytes.to_vec()),
        Compressor::Snappy => {
            #[cfg(feature = "snappy-compression")]
            {
                let mut encoder = snap::raw::Encoder::new();
                encoder.compress_vec(bytes).map_err(|e| {
                    ErrorKind::Internal {
                        message: format!("snappy compression failed: {e}"),
                    }
                    .into()
                })
            }
            #[cfg(not(feature = "snappy-compression"))]
            {
                Err(unsupported("snappy"))
            }
        }
        Compressor::Zlib { level } => {
            #[cfg(feature = "zlib-compression")]
            {
                let level = flate2::Compression::new(level.unwrap_or(6) as u32);
                let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), level);
                encoder.write_all(bytes)?;
                encoder.finish().map_err(Into::into)
            }
            #[cfg(not(feature = "zlib-compression"))]
            {
                let _ = level;
                Err(unsupported("zlib"))
            }
        }
        Compressor::Zstd { level } => {
            #[cfg(feature = "zstd-compression")]
            {
                zstd::stream::encode_all(bytes, level.unwrap_or(0)).map_err(|e| {
                    ErrorKind::Internal {
                        message: format!("zstd compression failed: {e}"),
                    }
                    .into()
                })
            }
            #[cfg(not(feature = "zstd-compression"))]
            {
                let _ = level;
                Err(unsupported("zstd"))
            }
        }
    }
}

#[allow(dead_code)]
fn unsupported(name: &str) -> crate::error::Error {
    ErrorKind::Internal {
        message: format!("{name} compression support was not enabled at build time"),
    }
    .into()
}
