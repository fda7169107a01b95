//! Key hashing helpers.
//!
//! String keys go through xxh64. Integer keys may use the number itself
//! as the hash so that a numeric pkey lands on a predictable shard.
use xxhash_rust::xxh64::xxh64;

pub const KKV_HASH_SEED: u64 = u64::from_le_bytes(*b"KKVINDEX");

#[inline]
pub fn hash64(bytes: &[u8]) -> u64 {
    xxh64(bytes, KKV_HASH_SEED)
}

/// Parses a decimal integer key and reinterprets it as a hash.
///
/// Negative values keep their two's complement bit pattern. Returns `None`
/// for anything that is not a plain integer.
pub fn number_hash(key: &str) -> Option<u64> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    if let Ok(v) = key.parse::<u64>() {
        return Some(v);
    }
    key.parse::<i64>().ok().map(|v| v as u64)
}
