use kkv_common::{KkvError, KkvResult};

pub(crate) const SIZE_OF_U8: usize = std::mem::size_of::<u8>();
pub(crate) const SIZE_OF_U32: usize = std::mem::size_of::<u32>();
pub(crate) const SIZE_OF_U64: usize = std::mem::size_of::<u64>();

pub(crate) fn get_u64_le(bytes: &[u8]) -> KkvResult<(u64, &[u8])> {
    if bytes.len() < SIZE_OF_U64 {
        return Err(KkvError::DecodeError("Invalid bytes".into()));
    }
    let (head, rest) = bytes.split_at(SIZE_OF_U64);
    let mut raw = [0u8; SIZE_OF_U64];
    raw.copy_from_slice(head);
    Ok((u64::from_le_bytes(raw), rest))
}

pub(crate) fn get_u32_le(bytes: &[u8]) -> KkvResult<(u32, &[u8])> {
    if bytes.len() < SIZE_OF_U32 {
        return Err(KkvError::DecodeError("Invalid bytes".into()));
    }
    let (head, rest) = bytes.split_at(SIZE_OF_U32);
    let mut raw = [0u8; SIZE_OF_U32];
    raw.copy_from_slice(head);
    Ok((u32::from_le_bytes(raw), rest))
}

pub(crate) fn get_u8_le(bytes: &[u8]) -> KkvResult<(u8, &[u8])> {
    if bytes.is_empty() {
        return Err(KkvError::DecodeError("Invalid bytes".into()));
    }
    Ok((bytes[0], &bytes[1..]))
}

pub(crate) fn get_bytes(bytes: &[u8], len: usize) -> KkvResult<(&[u8], &[u8])> {
    if bytes.len() < len {
        return Err(KkvError::DecodeError("Invalid bytes".into()));
    }
    Ok(bytes.split_at(len))
}
