use bytes::Bytes;
use kkv_common::KkvResult;

use crate::compress::{compress, decompress, CompressionType};

/// Converts stored values back to their plain form.
///
/// A value must be decoded exactly once. Values served from the search
/// cache are decoded before they enter the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlainFormatEncoder {
    compression_type: CompressionType,
}

impl PlainFormatEncoder {
    /// Returns `None` when values are stored in plain form already.
    pub fn new(compression_type: CompressionType) -> Option<Self> {
        if compression_type.is_none() {
            return None;
        }
        Some(Self { compression_type })
    }

    pub fn encode(&self, plain: &[u8]) -> Bytes {
        Bytes::from(compress(plain, self.compression_type))
    }

    pub fn decode(&self, stored: &[u8]) -> KkvResult<Bytes> {
        decompress(stored, self.compression_type)
    }
}
