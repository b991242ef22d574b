use crate::error::{ProtocolError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Default zlib level when the caller has no configured preference
pub const DEFAULT_LEVEL: u32 = 6;

/// Compresses data with zlib at the given level (0-9)
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if compression fails
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2 + 16),
        Compression::new(level.min(9)),
    );
    encoder
        .write_all(data)
        .map_err(|_| ProtocolError::CompressionFailure)?;
    encoder.finish().map_err(|_| ProtocolError::CompressionFailure)
}

/// Decompresses zlib data, refusing to produce more than `limit` bytes
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if:
/// - the stream is not valid zlib
/// - output size exceeds `limit`
pub fn decompress_limited(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    // Read one byte past the limit so an oversized stream is detectable.
    let mut reader = ZlibDecoder::new(data).take(limit as u64 + 1);
    reader
        .read_to_end(&mut out)
        .map_err(|_| ProtocolError::DecompressionFailure)?;

    if out.len() > limit {
        return Err(ProtocolError::DecompressionFailure);
    }
    Ok(out)
}

/// Compress data if requested, otherwise return it unchanged.
/// Returns the output bytes and a flag indicating whether compression was applied.
pub fn maybe_compress(data: &[u8], enabled: bool, level: u32) -> Result<(Vec<u8>, bool)> {
    if enabled {
        Ok((compress(data, level)?, true))
    } else {
        Ok((data.to_vec(), false))
    }
}

/// Decompress data only if it was previously compressed; otherwise return as-is.
pub fn maybe_decompress(data: &[u8], was_compressed: bool, limit: usize) -> Result<Vec<u8>> {
    if was_compressed {
        decompress_limited(data, limit)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn zlib_roundtrip() {
        let data = b"newsync newsync newsync newsync".repeat(32);
        let compressed = compress(&data, DEFAULT_LEVEL).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress_limited(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            decompress_limited(&[0xde, 0xad, 0xbe, 0xef], 1024),
            Err(ProtocolError::DecompressionFailure)
        ));
    }

    #[test]
    fn enforces_output_limit() {
        let data = vec![0u8; 64 * 1024];
        let compressed = compress(&data, 9).unwrap();
        assert!(decompress_limited(&compressed, 1024).is_err());
        assert_eq!(decompress_limited(&compressed, data.len()).unwrap().len(), data.len());
    }

    #[test]
    fn maybe_compress_passthrough() {
        let (out, applied) = maybe_compress(b"abc", false, DEFAULT_LEVEL).unwrap();
        assert!(!applied);
        assert_eq!(out, b"abc");
        assert_eq!(maybe_decompress(&out, false, 16).unwrap(), b"abc");
    }
}
