// src/metadata/codec.rs

//! Byte-level helpers shared by every repodata payload: gzip, sha256
//! digests and the base64 encoding used to persist revisions.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// Gzip-compress a byte slice
pub fn compress_gz(content: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    Ok(encoder.finish()?)
}

/// Decompress a gzip stream
pub fn decompress_gz(content: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(content);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::ParseError(format!("invalid gzip stream: {e}")))?;
    Ok(out)
}

/// Hex-encoded sha256 of a byte slice
pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Hex digests for several payloads, in order
pub fn checksums(contents: &[&[u8]]) -> Vec<String> {
    contents.iter().map(|c| sha256_hex(c)).collect()
}

pub fn b64_encode(content: &[u8]) -> String {
    STANDARD.encode(content)
}

pub fn b64_decode(content: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(content)?)
}

/// Decode a stored revision payload (base64 of gzip) into raw bytes.
///
/// Empty strings decode to `None`.
pub fn decode_stored(payload: &str) -> Result<Option<Vec<u8>>> {
    if payload.is_empty() {
        return Ok(None);
    }
    let gz = b64_decode(payload)?;
    Ok(Some(decompress_gz(&gz)?))
}

/// Gzip and base64 a raw payload for storage
pub fn encode_stored(raw: &[u8]) -> Result<String> {
    Ok(b64_encode(&compress_gz(raw)?))
}

/// Checksums and sizes of one payload in open and compressed form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDigest {
    pub open_checksum: String,
    pub open_size: u64,
    pub checksum: String,
    pub size: u64,
}

impl PayloadDigest {
    pub fn of(raw: &[u8], gz: &[u8]) -> Self {
        Self {
            open_checksum: sha256_hex(raw),
            open_size: raw.len() as u64,
            checksum: sha256_hex(gz),
            size: gz.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_roundtrip() {
        let data = b"<metadata packages=\"0\"/>".repeat(50);
        let gz = compress_gz(&data).unwrap();
        assert_ne!(gz, data);
        assert_eq!(decompress_gz(&gz).unwrap(), data);
    }

    #[test]
    fn test_gzip_empty_input() {
        let gz = compress_gz(b"").unwrap();
        assert!(decompress_gz(&gz).unwrap().is_empty());
    }

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_stored_payload_empty_is_none() {
        assert!(decode_stored("").unwrap().is_none());
        let stored = encode_stored(b"hello").unwrap();
        assert_eq!(decode_stored(&stored).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn test_invalid_gzip_is_parse_error() {
        assert!(matches!(decompress_gz(b"nope"), Err(Error::ParseError(_))));
    }
}
