use std::{fmt::Debug, hash::Hash};

use bytes::{Buf, BufMut, Bytes};
use kkv_common::UNINITIALIZED_EXPIRE_TIME;

use crate::config::FieldType;

/// Fixed-width integer used as the suffix key.
///
/// String suffix keys are hashed into `u64` before they reach the index.
pub trait SKeyType: Copy + Ord + Hash + Debug + Default + Send + Sync + 'static {
    const SIZE: usize;

    fn put_le<B: BufMut>(self, buf: &mut B);
    /// Caller must make sure `buf` holds at least `SIZE` bytes.
    fn get_le<B: Buf>(buf: &mut B) -> Self;
    /// Truncating conversion from a 64-bit key hash.
    fn from_hash(hash: u64) -> Self;
    fn to_hash(self) -> u64;
    /// Whether a suffix-key field declared as `field_type` is stored with this type.
    fn accepts(field_type: FieldType) -> bool;
}

macro_rules! impl_skey_type {
    ($t:ty, $put:ident, $get:ident, $($field:ident)|+) => {
        impl SKeyType for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            #[inline]
            fn put_le<B: BufMut>(self, buf: &mut B) {
                buf.$put(self);
            }

            #[inline]
            fn get_le<B: Buf>(buf: &mut B) -> Self {
                buf.$get()
            }

            #[inline]
            fn from_hash(hash: u64) -> Self {
                hash as $t
            }

            #[inline]
            fn to_hash(self) -> u64 {
                self as u64
            }

            fn accepts(field_type: FieldType) -> bool {
                matches!(field_type, $(FieldType::$field)|+)
            }
        }
    };
}

impl_skey_type!(i8, put_i8, get_i8, Int8);
impl_skey_type!(u8, put_u8, get_u8, UInt8);
impl_skey_type!(i16, put_i16_le, get_i16_le, Int16);
impl_skey_type!(u16, put_u16_le, get_u16_le, UInt16);
impl_skey_type!(i32, put_i32_le, get_i32_le, Int32);
impl_skey_type!(u32, put_u32_le, get_u32_le, UInt32);
impl_skey_type!(i64, put_i64_le, get_i64_le, Int64);
impl_skey_type!(u64, put_u64_le, get_u64_le, UInt64 | String);

/// One record produced by a segment reader during a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KkvDoc<S> {
    pub skey: S,
    /// Seconds.
    pub timestamp: u32,
    pub expire_time: u32,
    pub value: Bytes,
    pub skey_deleted: bool,
    /// Already resolved by a newer layer, kept only for cache bookkeeping.
    pub duplicated_key: bool,
    /// Value came from the search cache and is already in plain form.
    pub in_cache: bool,
}

impl<S: SKeyType> KkvDoc<S> {
    pub fn new(skey: S, timestamp: u32, value: Bytes) -> Self {
        Self {
            skey,
            timestamp,
            expire_time: UNINITIALIZED_EXPIRE_TIME,
            value,
            skey_deleted: false,
            duplicated_key: false,
            in_cache: false,
        }
    }

    pub fn deleted(skey: S, timestamp: u32) -> Self {
        Self {
            skey_deleted: true,
            ..Self::new(skey, timestamp, Bytes::new())
        }
    }

    pub fn with_expire_time(mut self, expire_time: u32) -> Self {
        self.expire_time = expire_time;
        self
    }

    #[inline]
    pub fn is_expired(&self, current_ts: u32) -> bool {
        is_expired(self.expire_time, current_ts)
    }

    /// Whether the doc survives the ttl window and its own expire time.
    #[inline]
    pub fn is_alive(&self, min_ts: u32, current_ts: u32) -> bool {
        self.timestamp >= min_ts && !self.is_expired(current_ts)
    }
}

#[inline]
pub(crate) fn is_expired(expire_time: u32, current_ts: u32) -> bool {
    expire_time != UNINITIALIZED_EXPIRE_TIME && expire_time <= current_ts
}
