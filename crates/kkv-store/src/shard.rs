//! Routes a prefix key to the shard owning it.
use kkv_common::{
    hash::{hash64, number_hash},
    KkvError, KkvResult, PKeyType, ShardId,
};

use crate::config::HashFunctionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPartitioner {
    shard_mask: u64,
    shard_count: u32,
    hash_function: HashFunctionType,
}

impl ShardPartitioner {
    /// # Errors
    /// - [KkvError::InvalidArgs] when `shard_count` is not a power of two
    pub fn new(shard_count: u32, hash_function: HashFunctionType) -> KkvResult<Self> {
        if shard_count == 0 || !shard_count.is_power_of_two() {
            return Err(KkvError::InvalidArgs(
                format!("shard count {} is not a power of two", shard_count).into(),
            ));
        }
        Ok(Self {
            shard_mask: shard_count as u64 - 1,
            shard_count,
            hash_function,
        })
    }

    #[inline]
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    #[inline]
    pub fn get_shard_idx(&self, key_hash: PKeyType) -> ShardId {
        (key_hash & self.shard_mask) as ShardId
    }

    pub fn hash_key(&self, key: &str) -> KkvResult<PKeyType> {
        match self.hash_function {
            HashFunctionType::Default => Ok(hash64(key.as_bytes())),
            HashFunctionType::NumberHash => number_hash(key).ok_or_else(|| {
                KkvError::InvalidArgs(format!("key [{}] is not a number", key).into())
            }),
        }
    }

    pub fn get_shard_idx_by_key(&self, key: &str) -> KkvResult<ShardId> {
        self.hash_key(key).map(|h| self.get_shard_idx(h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_non_power_of_two() {
        for count in [0, 3, 5, 6, 7, 12, 100] {
            assert!(matches!(
                ShardPartitioner::new(count, HashFunctionType::Default),
                Err(KkvError::InvalidArgs(_))
            ));
        }
        for count in [1, 2, 4, 64, 1 << 20] {
            assert!(ShardPartitioner::new(count, HashFunctionType::Default).is_ok());
        }
    }

    #[test]
    fn number_hash_key() {
        let p = ShardPartitioner::new(8, HashFunctionType::NumberHash).unwrap();
        assert_eq!(p.hash_key("13").unwrap(), 13);
        assert_eq!(p.get_shard_idx_by_key("13").unwrap(), 5);
        assert!(matches!(p.hash_key("x13"), Err(KkvError::InvalidArgs(_))));
    }

    #[test]
    fn default_hash_key() {
        let p = ShardPartitioner::new(4, HashFunctionType::Default).unwrap();
        let h = p.hash_key("user-1").unwrap();
        assert_eq!(h, hash64(b"user-1"));
        assert_eq!(p.get_shard_idx_by_key("user-1").unwrap(), (h & 3) as u32);
    }

    proptest! {
        #[test]
        fn shard_idx_is_masked_hash(shift in 0u32..16, hash in any::<u64>()) {
            let count = 1u32 << shift;
            let p = ShardPartitioner::new(count, HashFunctionType::Default).unwrap();
            prop_assert_eq!(p.get_shard_idx(hash) as u64, hash & (count as u64 - 1));
            prop_assert!(p.get_shard_idx(hash) < count);
        }

        #[test]
        fn init_fails_off_powers_of_two(count in 0u32..100_000) {
            prop_assume!(!count.is_power_of_two());
            prop_assert!(ShardPartitioner::new(count, HashFunctionType::Default).is_err());
        }
    }
}
