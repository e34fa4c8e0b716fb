// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transparent compression for large cached payloads.
//!
//! Uses zstd with magic-bytes detection, so compressed and plain payloads
//! can live side by side in the same store and decode without a flag.
//!
//! # Feature Flag
//!
//! Compression requires the `compression` feature:
//!
//! ```toml
//! [dependencies]
//! query-cache = { version = "0.1", features = ["compression"] }
//! ```
//!
//! Without it, [`compress_bytes`] returns its input unchanged and
//! [`decompress_bytes`] rejects zstd frames it cannot read.

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
#[cfg(feature = "compression")]
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    CompressFailed(String),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),
}

/// Check if data is zstd-compressed by checking magic bytes.
///
/// JSON text can never begin with these bytes, so the check is unambiguous
/// for payloads produced by [`crate::serialization`].
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

#[cfg(feature = "compression")]
pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    zstd::encode_all(data, DEFAULT_COMPRESSION_LEVEL)
        .map_err(|e| CompressionError::CompressFailed(e.to_string()))
}

#[cfg(not(feature = "compression"))]
pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    Ok(data.to_vec())
}

/// Decompress if the payload carries the zstd magic, otherwise pass through.
#[cfg(feature = "compression")]
pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if is_compressed(data) {
        zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(not(feature = "compression"))]
pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if is_compressed(data) {
        Err(CompressionError::DecompressFailed(
            "payload is zstd-compressed but the `compression` feature is disabled".to_string(),
        ))
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json_is_not_detected_as_compressed() {
        assert!(!is_compressed(br#"{"a":1}"#));
        assert!(!is_compressed(b"[1,2,3]"));
        assert!(!is_compressed(b""));
    }

    #[test]
    fn test_magic_detection() {
        assert!(is_compressed(&[0x28, 0xB5, 0x2F, 0xFD, 0x00]));
    }

    #[test]
    fn test_plain_payload_passes_through() {
        let data = br#"{"plain":true}"#;
        assert_eq!(decompress_bytes(data).unwrap(), data.to_vec());
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_compressed_payload_roundtrip() {
        let data = br#"{"rows":[1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1]}"#.repeat(20);
        let compressed = compress_bytes(&data).unwrap();
        assert!(is_compressed(&compressed));
        assert!(compressed.len() < data.len());
        assert_eq!(decompress_bytes(&compressed).unwrap(), data);
    }

    #[cfg(not(feature = "compression"))]
    #[test]
    fn test_compressed_payload_rejected_without_feature() {
        assert!(decompress_bytes(&[0x28, 0xB5, 0x2F, 0xFD, 0x00]).is_err());
    }
}
