//! Common types for the KKV index crates.
//!
//! This is an internal lib. The engine itself lives in `kkv-store`.
use serde::{Deserialize, Serialize};

mod error;
pub mod hash;

pub use error::{KkvError, KkvResult};

/// Hash of the prefix key.
pub type PKeyType = u64;
pub type SegmentId = u32;
pub type SchemaId = u32;
pub type ShardId = u32;

/// Expire time used by records that never expire on their own.
pub const UNINITIALIZED_EXPIRE_TIME: u32 = 0;
/// Timestamp of a record that was never stamped.
pub const INVALID_TIMESTAMP: u32 = u32::MAX;

/// Input timestamps are in microseconds, stored timestamps are in seconds.
#[inline]
pub fn micro_to_sec(ts_us: u64) -> u32 {
    let sec = ts_us / 1_000_000;
    if sec >= INVALID_TIMESTAMP as u64 {
        INVALID_TIMESTAMP - 1
    } else {
        sec as u32
    }
}

/// Position in the write stream.
///
/// Two locators only compare when they come from the same `src`. A locator
/// from another stream is never considered covered by this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub src: u64,
    pub offset: i64,
}

impl Locator {
    pub const fn new(src: u64, offset: i64) -> Self {
        Self { src, offset }
    }

    pub const fn invalid() -> Self {
        Self { src: 0, offset: -1 }
    }

    pub fn is_valid(&self) -> bool {
        self.offset >= 0
    }

    /// Whether data at `self` is not reflected by something tagged with `other`.
    pub fn is_newer_than(&self, other: &Locator) -> bool {
        if !other.is_valid() || self.src != other.src {
            return true;
        }
        self.offset > other.offset
    }
}

impl Default for Locator {
    fn default() -> Self {
        Self::invalid()
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.src, self.offset)
    }
}
