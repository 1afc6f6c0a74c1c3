//! Block codec
//!
//! Applied to each stored block on its own. Compression is a store-wide
//! setting: a reader configured differently from the writer gets garbage or
//! a `Codec` error, never silently wrong lengths.

use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockCodec {
    #[default]
    None,
    /// Raw snappy (no framing)
    Snappy,
}

impl BlockCodec {
    pub fn from_compress(compress: bool) -> Self {
        if compress {
            BlockCodec::Snappy
        } else {
            BlockCodec::None
        }
    }

    pub fn encode(&self, block: &[u8]) -> Result<Vec<u8>> {
        match self {
            BlockCodec::None => Ok(block.to_vec()),
            BlockCodec::Snappy => snap::raw::Encoder::new()
                .compress_vec(block)
                .map_err(|e| StorageError::Codec(format!("snappy compress failed: {}", e))),
        }
    }

    pub fn decode(&self, stored: &[u8]) -> Result<Vec<u8>> {
        match self {
            BlockCodec::None => Ok(stored.to_vec()),
            BlockCodec::Snappy => snap::raw::Decoder::new()
                .decompress_vec(stored)
                .map_err(|e| StorageError::Codec(format!("snappy decompress failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snappy_shrinks_repetitive_block() {
        let block = vec![7u8; 4096];
        let codec = BlockCodec::from_compress(true);
        let stored = codec.encode(&block).unwrap();
        assert!(stored.len() < block.len());
        assert_eq!(codec.decode(&stored).unwrap(), block);
    }

    #[test]
    fn test_none_is_identity() {
        let codec = BlockCodec::default();
        assert_eq!(codec.encode(b"abc").unwrap(), b"abc".to_vec());
        assert_eq!(codec.decode(b"abc").unwrap(), b"abc".to_vec());
    }

    #[test]
    fn test_garbage_is_codec_error() {
        let err = BlockCodec::Snappy.decode(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err, StorageError::Codec(_)));
    }
}
