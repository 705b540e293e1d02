use std::io::Read;

use super::Compressor;
use crate::error::{ErrorKind, Result};

pub(crate) fn decompress(bytes: &[u8], compressor: Compressor, expected_len: usize) -> Result<Vec<u8>> {
    let out = match compressor {
        Compressor::Noop => bytes.to_vec(),
        Compressor::Snappy => {
            #[cfg(feature = "snappy-compression")]
            {
                let mut decoder = snap::raw::Decoder::new();
                decoder.decompress_vec(bytes).map_err(|e| {
                    ErrorKind::InvalidResponse {
                        message: format!("snappy decompression failed: {e}"),
                    }
                })?
            }
            #[cfg(not(feature = "snappy-compression"))]
            {
                return Err(unsupported("snappy"));
            }
        }
        Compressor::Zlib { .. } => {
            #[cfg(feature = "zlib-compression")]
            {
                let mut decoder = flate2::read::ZlibDecoder::new(bytes);
                let mut out = Vec::with_capacity(expected_len);
                decoder.read_to_end(&mut out)?;
                out
            }
            #[cfg(not(feature = "zlib-compression"))]
            {
                return Err(unsupported("zlib"));
            }
        }
        Compressor::Zstd { .. } => {
            #[cfg(feature = "zstd-compression")]
            {
                zstd::stream::decode_all(bytes).map_err(|e| {
                    ErrorKind::InvalidResponse {
                        message: format!("zstd decompression failed: {e}"),
                    }
                })?
            }
            #[cfg(not(feature = "zstd-compression"))]
            {
                return Err(unsupported("zstd"));
            }
        }
    };
    if out.len() != expected_len {
        return Err(ErrorKind::InvalidResponse {
            message: format!(
                "decompressed message length {} did not match advertised length {}",
                out.len(),
                expected_len
            ),
        }
        .into());
    }
    Ok(out)
}

#[allow(dead_code)]
fn unsupported(name: &str) -> crate::error::Error {
    ErrorKind::Internal {
        message: format!("{name} compression support was not enabled at build time"),
    }
    .into()
}

#[cfg(test)]
mod test {
    use super::super::compress;
    use super::*;

    #[test]
    fn noop_roundtrip() {
        let data = b"hello world";
        let compressed = compress(data, Compressor::Noop).unwrap();
        let decompressed = decompress(&compressed, Compressor::Noop, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }
}
