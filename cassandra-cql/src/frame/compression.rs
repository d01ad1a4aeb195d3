//! Frame body compression.
//!
//! A [`Compressor`] is announced to the server by its algorithm name in the
//! STARTUP options and, once accepted, applied to every subsequent frame body.

use bytes::{Buf, BufMut};
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompressionError {
    #[error("Error compressing lz4 data: {0}")]
    Lz4Compress(String),
    #[error("Error decompressing lz4 data: {0}")]
    Lz4Decompress(String),
    #[error("Snappy failure: {0}")]
    Snappy(String),
    #[error("Compressed body is truncated")]
    Truncated,
}

/// Compresses and decompresses whole frame bodies.
pub trait Compressor: Send + Sync + std::fmt::Debug {
    /// Algorithm name, as listed in SUPPORTED and sent in STARTUP.
    fn algorithm(&self) -> &str;

    /// Appends the compressed form of `uncompressed` to `out`.
    fn compress(&self, uncompressed: &[u8], out: &mut Vec<u8>) -> Result<(), CompressionError>;

    fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>, CompressionError>;
}

/// The wire protocol compression algorithms shipped with this crate.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    pub fn compressor(self) -> Arc<dyn Compressor> {
        match self {
            Compression::Lz4 => Arc::new(Lz4Compressor),
            Compression::Snappy => Arc::new(SnappyCompressor),
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Lz4 => f.write_str("lz4"),
            Compression::Snappy => f.write_str("snappy"),
        }
    }
}

/// LZ4 block format prefixed with the big-endian uncompressed length.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> &str {
        "lz4"
    }

    fn compress(&self, uncompressed: &[u8], out: &mut Vec<u8>) -> Result<(), CompressionError> {
        let uncomp_len = u32::try_from(uncompressed.len())
            .map_err(|e| CompressionError::Lz4Compress(e.to_string()))?;
        let tmp = lz4_flex::compress(uncompressed);
        out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
        out.put_u32(uncomp_len);
        out.extend_from_slice(&tmp[..]);
        Ok(())
    }

    fn decompress(&self, mut compressed: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if compressed.len() < 4 {
            return Err(CompressionError::Truncated);
        }
        let uncomp_len = compressed.get_u32() as usize;
        lz4_flex::decompress(compressed, uncomp_len)
            .map_err(|e| CompressionError::Lz4Decompress(e.to_string()))
    }
}

/// Raw (unframed) snappy.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnappyCompressor;

impl Compressor for SnappyCompressor {
    fn algorithm(&self) -> &str {
        "snappy"
    }

    fn compress(&self, uncompressed: &[u8], out: &mut Vec<u8>) -> Result<(), CompressionError> {
        let old_size = out.len();
        out.resize(old_size + snap::raw::max_compress_len(uncompressed.len()), 0);
        let compressed_size = snap::raw::Encoder::new()
            .compress(uncompressed, &mut out[old_size..])
            .map_err(|e| CompressionError::Snappy(e.to_string()))?;
        out.truncate(old_size + compressed_size);
        Ok(())
    }

    fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>, CompressionError> {
        snap::raw::Decoder::new()
            .decompress_vec(compressed)
            .map_err(|e| CompressionError::Snappy(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_appends_length_prefixed_block() {
        let mut out = Vec::from(&b"Hello"[..]);
        let expect = vec![
            72, 101, 108, 108, 111, 0, 0, 0, 8, 128, 44, 32, 87, 111, 114, 108, 100, 33,
        ];

        Lz4Compressor.compress(b", World!", &mut out).unwrap();
        assert_eq!(expect, out);
    }

    #[test]
    fn lz4_decompress() {
        let mut comp_body = Vec::new();
        let uncomp_body = "Hello, World!".repeat(100);
        Lz4Compressor
            .compress(uncomp_body.as_bytes(), &mut comp_body)
            .unwrap();
        let result = Lz4Compressor.decompress(&comp_body[..]).unwrap();
        assert_eq!(32, comp_body.len());
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn lz4_rejects_missing_length() {
        assert_eq!(
            Lz4Compressor.decompress(&[0, 1]),
            Err(CompressionError::Truncated)
        );
    }

    #[test]
    fn snappy_decompress() {
        let body = "INSERT INTO t (id, v) VALUES (?, ?)".repeat(10);
        let mut comp_body = Vec::new();
        SnappyCompressor
            .compress(body.as_bytes(), &mut comp_body)
            .unwrap();
        assert!(comp_body.len() < body.len());
        assert_eq!(
            SnappyCompressor.decompress(&comp_body).unwrap(),
            body.as_bytes()
        );
    }

    #[test]
    fn algorithm_names_match_startup_option() {
        assert_eq!(Compression::Lz4.compressor().algorithm(), "lz4");
        assert_eq!(Compression::Snappy.compressor().algorithm(), "snappy");
        assert_eq!(Compression::Snappy.to_string(), "snappy");
    }
}
