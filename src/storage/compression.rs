//! Body codec of data files
//!
//! Only the row body of a data file is compressed. The header frame stays
//! plain JSON and records which codec wrote the body, so files written
//! under different `compression` settings stay readable side by side.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Codec applied to a data file body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    #[default]
    Zstd,
}

impl CompressionAlgorithm {
    /// Encode a body. `level` is clamped to what the codec supports and
    /// ignored by `None`.
    pub fn compress(self, body: &[u8], level: i32) -> Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::None => Ok(body.to_vec()),
            CompressionAlgorithm::Zstd => {
                let range = zstd::compression_level_range();
                let level = level.clamp(*range.start(), *range.end());
                zstd::stream::encode_all(body, level)
                    .map_err(|e| Error::StorageUnavailable(format!("Failed to compress body: {}", e)))
            }
        }
    }

    /// Decode a body written by [`compress`](Self::compress)
    pub fn decompress(self, body: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::None => Ok(body.to_vec()),
            CompressionAlgorithm::Zstd => zstd::stream::decode_all(body).map_err(|e| {
                Error::StorageUnavailable(format!("Corrupt data file body: {}", e))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<u8> {
        b"[1,\"Compra no supermercado\",52.3,\"2024-01-02\"],".repeat(20)
    }

    #[test]
    fn test_plain_body_is_untouched() -> Result<()> {
        let body = b"[[1,\"rent\",1200.0]]";
        let encoded = CompressionAlgorithm::None.compress(body, 19)?;
        assert_eq!(encoded, body);
        assert_eq!(CompressionAlgorithm::None.decompress(&encoded)?, body);
        Ok(())
    }

    #[test]
    fn test_zstd_shrinks_repetitive_rows() -> Result<()> {
        let body = rows();
        let encoded = CompressionAlgorithm::Zstd.compress(&body, 3)?;
        assert!(encoded.len() < body.len());
        assert_eq!(CompressionAlgorithm::Zstd.decompress(&encoded)?, body);
        Ok(())
    }

    #[test]
    fn test_out_of_range_level_is_clamped() -> Result<()> {
        let body = rows();
        let encoded = CompressionAlgorithm::Zstd.compress(&body, 1000)?;
        assert_eq!(CompressionAlgorithm::Zstd.decompress(&encoded)?, body);
        Ok(())
    }

    #[test]
    fn test_garbage_body_is_storage_error() {
        let err = CompressionAlgorithm::Zstd.decompress(b"not zstd at all").unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
    }
}
