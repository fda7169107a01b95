//! Packed search-cache entry of one pkey.
//!
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │ KkvCacheItem buffer                                                    │
//! │┌ ─ ─ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┐│
//! │  CachedSKeyNode    ...    CachedSKeyNode        Value Bytes            │
//! ││  node size      │      │  node size      │ sum of value lengths      ││
//! │ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ │
//! └────────────────────────────────────────────────────────────────────────┘
//!
//! A node is `skey | timestamp u32 | expire time u32 | value offset u32`.
//! The value offset is the cumulative end of the node's value inside the
//! value bytes, so value `i` spans `offset[i - 1]..offset[i]`.
use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes};
use kkv_common::{Locator, SegmentId};
use parking_lot::RwLock;

use crate::{
    search_cache::CacheItem,
    types::{KkvDoc, SKeyType},
    utils::SIZE_OF_U32,
};

const CACHE_ITEM_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedSKeyNode<S> {
    pub skey: S,
    pub timestamp: u32,
    pub expire_time: u32,
    pub value_offset: u32,
}

impl<S: SKeyType> CachedSKeyNode<S> {
    pub const SIZE: usize = S::SIZE + 3 * SIZE_OF_U32;

    fn write(&self, buf: &mut Vec<u8>) {
        self.skey.put_le(buf);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.expire_time);
        buf.put_u32_le(self.value_offset);
    }

    fn read(mut raw: &[u8]) -> Self {
        let skey = S::get_le(&mut raw);
        Self {
            skey,
            timestamp: raw.get_u32_le(),
            expire_time: raw.get_u32_le(),
            value_offset: raw.get_u32_le(),
        }
    }
}

/// All live disk-layer skeys of one pkey, as of `locator`.
///
/// The nodes and the values share a single allocation that is released
/// when the last handle to the item is dropped.
#[derive(Debug)]
pub struct KkvCacheItem<S> {
    base: Bytes,
    count: u32,
    next_rt_segment_id: SegmentId,
    timestamp: u32,
    locator: RwLock<Locator>,
    format_version: u8,
    _marker: PhantomData<fn() -> S>,
}

impl<S: SKeyType> KkvCacheItem<S> {
    /// Packs `docs` in order, skipping deleted skeys.
    ///
    /// Values are copied as they are: callers store plain values only.
    pub fn create<'a, I>(docs: I) -> Self
    where
        I: IntoIterator<Item = &'a KkvDoc<S>>,
        I::IntoIter: Clone,
    {
        let docs = docs.into_iter().filter(|d| !d.skey_deleted);
        let (count, value_len) = docs
            .clone()
            .fold((0usize, 0usize), |(c, l), d| (c + 1, l + d.value.len()));
        let total = count * CachedSKeyNode::<S>::SIZE + value_len;
        let mut buf = Vec::with_capacity(total);
        let mut value_offset = 0u32;
        for doc in docs.clone() {
            value_offset += doc.value.len() as u32;
            CachedSKeyNode {
                skey: doc.skey,
                timestamp: doc.timestamp,
                expire_time: doc.expire_time,
                value_offset,
            }
            .write(&mut buf);
        }
        for doc in docs {
            buf.put_slice(&doc.value);
        }
        debug_assert_eq!(buf.len(), total);
        Self {
            base: Bytes::from(buf),
            count: count as u32,
            next_rt_segment_id: 0,
            timestamp: 0,
            locator: RwLock::new(Locator::invalid()),
            format_version: CACHE_ITEM_FORMAT_VERSION,
            _marker: PhantomData,
        }
    }

    pub fn with_locator(self, locator: Locator) -> Self {
        *self.locator.write() = locator;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_next_rt_segment_id(mut self, id: SegmentId) -> Self {
        self.next_rt_segment_id = id;
        self
    }

    /// An empty item still answers lookups: everything was deleted.
    pub fn count(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn next_rt_segment_id(&self) -> SegmentId {
        self.next_rt_segment_id
    }

    pub fn locator(&self) -> Locator {
        *self.locator.read()
    }

    /// Marks the item as current up to `locator` without touching its nodes.
    pub fn refresh_locator(&self, locator: Locator) {
        *self.locator.write() = locator;
    }

    fn nodes_len(&self) -> usize {
        self.count() * CachedSKeyNode::<S>::SIZE
    }

    pub fn node(&self, idx: usize) -> CachedSKeyNode<S> {
        assert!(idx < self.count());
        let start = idx * CachedSKeyNode::<S>::SIZE;
        CachedSKeyNode::read(&self.base[start..start + CachedSKeyNode::<S>::SIZE])
    }

    pub fn skey_nodes(&self) -> impl Iterator<Item = CachedSKeyNode<S>> + '_ {
        self.base[..self.nodes_len()]
            .chunks_exact(CachedSKeyNode::<S>::SIZE)
            .map(CachedSKeyNode::read)
    }

    pub fn values(&self) -> &[u8] {
        &self.base[self.nodes_len()..]
    }

    /// Shares the buffer, no copy.
    pub fn value(&self, idx: usize) -> Bytes {
        let end = self.node(idx).value_offset as usize;
        let start = if idx == 0 {
            0
        } else {
            self.node(idx - 1).value_offset as usize
        };
        let base = self.nodes_len();
        self.base.slice(base + start..base + end)
    }

    /// Nodes as docs flagged `in_cache`.
    pub fn docs(&self) -> impl Iterator<Item = KkvDoc<S>> + '_ {
        let base = self.nodes_len();
        let mut start = 0usize;
        self.skey_nodes().map(move |node| {
            let end = node.value_offset as usize;
            let doc = KkvDoc {
                skey: node.skey,
                timestamp: node.timestamp,
                expire_time: node.expire_time,
                value: self.base.slice(base + start..base + end),
                skey_deleted: false,
                duplicated_key: false,
                in_cache: true,
            };
            start = end;
            doc
        })
    }

    /// Total bytes of nodes and values.
    pub fn size(&self) -> usize {
        let size = match self.count() {
            0 => 0,
            n => n * CachedSKeyNode::<S>::SIZE + self.node(n - 1).value_offset as usize,
        };
        debug_assert_eq!(size, self.base.len());
        size
    }

    /// Hook for format and schema compatibility checks. Items are never
    /// persisted, so only the in-memory layout version is compared.
    pub fn is_cache_item_valid(&self) -> bool {
        self.format_version == CACHE_ITEM_FORMAT_VERSION
            && self.base.len() >= self.nodes_len()
    }
}

impl<S: SKeyType> CacheItem for KkvCacheItem<S> {
    fn weight(&self) -> u64 {
        (self.base.len() + std::mem::size_of::<Self>()) as u64
    }
}
