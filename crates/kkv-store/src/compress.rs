//! Compression shared by stored values and built-segment blocks.
//!
//! LZ4 payloads carry their plain length as a 4 bytes little endian prefix.
use bytes::Bytes;
use kkv_common::{KkvError, KkvResult};

use crate::utils::get_u32_le;

/// Upper bound of a single decompressed payload. A larger prefix means the
/// input is corrupted.
const MAX_PLAIN_LEN: usize = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    LZ4 = 1,
}

impl CompressionType {
    pub fn is_none(&self) -> bool {
        *self == CompressionType::None
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = KkvError;

    fn try_from(value: u8) -> KkvResult<Self> {
        [CompressionType::None, CompressionType::LZ4]
            .into_iter()
            .find(|t| *t as u8 == value)
            .ok_or_else(|| {
                KkvError::DecodeError(format!("unknown compression type {}", value).into())
            })
    }
}

impl From<CompressionType> for u8 {
    fn from(value: CompressionType) -> Self {
        value as u8
    }
}

pub fn compress(plain: &[u8], compression_type: CompressionType) -> Vec<u8> {
    match compression_type {
        CompressionType::None => plain.to_vec(),
        CompressionType::LZ4 => lz4_flex::compress_prepend_size(plain),
    }
}

pub fn decompress(stored: &[u8], compression_type: CompressionType) -> KkvResult<Bytes> {
    match compression_type {
        CompressionType::None => Ok(Bytes::copy_from_slice(stored)),
        CompressionType::LZ4 => {
            let (plain_len, _) = get_u32_le(stored)?;
            if plain_len as usize > MAX_PLAIN_LEN {
                return Err(KkvError::DecodeError(
                    format!("lz4 payload claims {} plain bytes", plain_len).into(),
                ));
            }
            lz4_flex::decompress_size_prepended(stored)
                .map(Bytes::from)
                .map_err(|e| KkvError::DecodeError(format!("lz4: {}", e).into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tag() {
        for t in [CompressionType::None, CompressionType::LZ4] {
            assert_eq!(CompressionType::try_from(u8::from(t)).unwrap(), t);
        }
        assert!(matches!(CompressionType::try_from(7), Err(KkvError::DecodeError(_))));
    }

    #[test]
    fn lz4() {
        let plain = b"kkv kkv kkv kkv kkv kkv kkv kkv".repeat(4);
        let stored = compress(&plain, CompressionType::LZ4);
        assert!(stored.len() < plain.len());
        assert_eq!(&decompress(&stored, CompressionType::LZ4).unwrap()[..], &plain[..]);
        assert!(decompress(&stored[..3], CompressionType::LZ4).is_err());
    }

    #[test]
    fn rejects_huge_prefix() {
        let mut stored = u32::MAX.to_le_bytes().to_vec();
        stored.extend_from_slice(b"garbage");
        assert!(matches!(
            decompress(&stored, CompressionType::LZ4),
            Err(KkvError::DecodeError(_))
        ));
    }
}
