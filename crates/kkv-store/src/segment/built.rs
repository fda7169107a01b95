//! Built segment: one immutable block file per shard.
//!
//! ┌──────────────────────────────────────────────────────────────────────────────────────────┐
//! │ Shard File                                                                               │
//! │┌ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ┐│
//! │  Magic Number  Schema Version   Flags    SKey Size   Block ...    Block Meta  Meta Offset │
//! ││     u32     │      u8       │   u8    │    u8     │   bytes    │   bytes   │     u32     ││
//! │ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ │
//! └──────────────────────────────────────────────────────────────────────────────────────────┘
//!
//! A block stores pkey entries sorted by pkey:
//!
//! ┌──────────────────────────────────────────────────────────────────────────────┐
//! │ Block                                                                        │
//! │┌ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ─ ┐ │
//! │   Entry      ...      Entry     offset     ...     count     Block Checksum  │
//! ││  bytes    │       │   bytes   │   u32   │        │   u32   │      u32       ││
//! │ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─  │
//! └──────────────────────────────────────────────────────────────────────────────┘
//!
//! Everything before the checksum may be LZ4 compressed, the checksum is
//! computed over the stored bytes. An entry is `pkey: u64` followed by the
//! pkey record:
//!
//! ```text
//! flags u8 (pkey deleted) | deleted ts u32 | count u32 |
//!     (skey | flags u8 (skey deleted) | ts u32 | [expire u32] | len u32 | value)*
//! ```
use std::{marker::PhantomData, sync::Arc};

use bytes::{Buf, BufMut, Bytes};
use kkv_common::{KkvError, KkvResult, PKeyType, ShardId, UNINITIALIZED_EXPIRE_TIME};

use crate::{
    compress::{compress, decompress, CompressionType},
    segment::PKeyDocs,
    types::{KkvDoc, SKeyType},
    utils::{get_bytes, get_u32_le, get_u64_le, get_u8_le, SIZE_OF_U32, SIZE_OF_U64, SIZE_OF_U8},
};

pub(crate) const XXH_SEED: u32 = u32::from_le_bytes(*b"KKVD");
const MAGIC_BYTES: [u8; 4] = *b"KKVD";
const CURRENT_SCHEMA_VERSION: u8 = 0;
const HEADER_LEN: usize = SIZE_OF_U32 + 3 * SIZE_OF_U8;
const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;
const DEFAULT_BLOCK_CACHE_SIZE: usize = 1 << 10;
const MAX_BLOCK_NUM: u32 = 10_000_000;
const FLAG_STORE_EXPIRE_TIME: u8 = 1;
const FLAG_DELETED: u8 = 1;

fn encode_pkey_docs<S: SKeyType>(docs: &PKeyDocs<S>, store_expire_time: bool, buf: &mut Vec<u8>) {
    buf.put_u8(if docs.is_pkey_deleted() { FLAG_DELETED } else { 0 });
    buf.put_u32_le(docs.deleted_ts.unwrap_or(0));
    buf.put_u32_le(docs.docs.len() as u32);
    for doc in &docs.docs {
        doc.skey.put_le(buf);
        buf.put_u8(if doc.skey_deleted { FLAG_DELETED } else { 0 });
        buf.put_u32_le(doc.timestamp);
        if store_expire_time {
            buf.put_u32_le(doc.expire_time);
        }
        buf.put_u32_le(doc.value.len() as u32);
        buf.put_slice(&doc.value);
    }
}

fn decode_pkey_docs<S: SKeyType>(data: &Bytes, store_expire_time: bool) -> KkvResult<PKeyDocs<S>> {
    let (flags, rest) = get_u8_le(data)?;
    let (deleted_ts, rest) = get_u32_le(rest)?;
    let (count, mut rest) = get_u32_le(rest)?;
    let mut docs = Vec::with_capacity((count as usize).min(rest.len()));
    for _ in 0..count {
        if rest.len() < S::SIZE {
            return Err(KkvError::DecodeError("Invalid pkey record".into()));
        }
        let skey = S::get_le(&mut rest);
        let (skey_flags, r) = get_u8_le(rest)?;
        let (timestamp, r) = get_u32_le(r)?;
        let (expire_time, r) = if store_expire_time {
            get_u32_le(r)?
        } else {
            (UNINITIALIZED_EXPIRE_TIME, r)
        };
        let (len, r) = get_u32_le(r)?;
        let (value, r) = get_bytes(r, len as usize)?;
        let value_start = data.len() - r.len() - value.len();
        docs.push(KkvDoc {
            skey,
            timestamp,
            expire_time,
            value: data.slice(value_start..value_start + value.len()),
            skey_deleted: skey_flags & FLAG_DELETED != 0,
            duplicated_key: false,
            in_cache: false,
        });
        rest = r;
    }
    Ok(PKeyDocs {
        deleted_ts: if flags & FLAG_DELETED != 0 {
            Some(deleted_ts)
        } else {
            None
        },
        docs,
    })
}

#[derive(Debug, Clone)]
struct BlockMeta {
    offset: usize,
    first_pkey: PKeyType,
    last_pkey: PKeyType,
    compression_type: CompressionType,
}

impl BlockMeta {
    const ENCODED_LEN: usize = SIZE_OF_U32 + 2 * SIZE_OF_U64 + SIZE_OF_U8;

    /// count u32 | (offset u32 | first pkey u64 | last pkey u64 | compression u8)* | checksum u32
    fn encode_meta(meta: &[BlockMeta], buf: &mut Vec<u8>) {
        buf.reserve(SIZE_OF_U32 * 2 + meta.len() * Self::ENCODED_LEN);
        let ori_length = buf.len();
        buf.put_u32_le(meta.len() as u32);
        for m in meta {
            buf.put_u32_le(m.offset as u32);
            buf.put_u64_le(m.first_pkey);
            buf.put_u64_le(m.last_pkey);
            buf.put_u8(m.compression_type.into());
        }
        let checksum = xxhash_rust::xxh32::xxh32(&buf[ori_length + SIZE_OF_U32..], XXH_SEED);
        buf.put_u32_le(checksum);
    }

    fn decode_meta(data: &[u8]) -> KkvResult<Vec<BlockMeta>> {
        let (num, data) = get_u32_le(data)?;
        if num > MAX_BLOCK_NUM {
            return Err(KkvError::DecodeError("Invalid bytes".into()));
        }
        let body_len = num as usize * Self::ENCODED_LEN;
        let (body, tail) = get_bytes(data, body_len)?;
        let (checksum_read, _) = get_u32_le(tail)?;
        if checksum_read != xxhash_rust::xxh32::xxh32(body, XXH_SEED) {
            return Err(KkvError::DecodeChecksumMismatchError);
        }
        let mut ans = Vec::with_capacity(num as usize);
        let mut buf = body;
        for _ in 0..num {
            let (offset, r) = get_u32_le(buf)?;
            let (first_pkey, r) = get_u64_le(r)?;
            let (last_pkey, r) = get_u64_le(r)?;
            let (compression_type, r) = get_u8_le(r)?;
            ans.push(BlockMeta {
                offset: offset as usize,
                first_pkey,
                last_pkey,
                compression_type: compression_type.try_into()?,
            });
            buf = r;
        }
        Ok(ans)
    }
}

#[derive(Debug)]
struct BlockBuilder {
    data: Vec<u8>,
    offsets: Vec<u32>,
    first_pkey: PKeyType,
    last_pkey: PKeyType,
    block_size: usize,
}

impl BlockBuilder {
    fn new(block_size: usize) -> Self {
        Self {
            data: Vec::new(),
            offsets: Vec::new(),
            first_pkey: 0,
            last_pkey: 0,
            block_size,
        }
    }

    fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    fn estimated_size(&self) -> usize {
        self.data.len() + (self.offsets.len() + 2) * SIZE_OF_U32
    }

    /// Returns false when the block is full. An empty block accepts any entry.
    fn add(&mut self, pkey: PKeyType, record: &[u8]) -> bool {
        let entry_size = SIZE_OF_U64 + record.len() + SIZE_OF_U32;
        if !self.is_empty() && self.estimated_size() + entry_size > self.block_size {
            return false;
        }
        if self.is_empty() {
            self.first_pkey = pkey;
        }
        self.offsets.push(self.data.len() as u32);
        self.data.put_u64_le(pkey);
        self.data.put_slice(record);
        self.last_pkey = pkey;
        true
    }

    /// Appends the encoded block to `buf` and returns the compression really used.
    fn encode(self, buf: &mut Vec<u8>, compression_type: CompressionType) -> CompressionType {
        let mut raw = self.data;
        for offset in &self.offsets {
            raw.put_u32_le(*offset);
        }
        raw.put_u32_le(self.offsets.len() as u32);
        let start = buf.len();
        let real_compression_type = match compression_type {
            CompressionType::None => {
                buf.put_slice(&raw);
                CompressionType::None
            }
            CompressionType::LZ4 => {
                let compressed = compress(&raw, compression_type);
                if compressed.len() >= raw.len() {
                    buf.put_slice(&raw);
                    CompressionType::None
                } else {
                    buf.put_slice(&compressed);
                    CompressionType::LZ4
                }
            }
        };
        let checksum = xxhash_rust::xxh32::xxh32(&buf[start..], XXH_SEED);
        buf.put_u32_le(checksum);
        real_compression_type
    }
}

#[derive(Debug)]
struct DiskBlock {
    data: Bytes,
    offsets: Vec<u32>,
    entries_end: usize,
}

impl DiskBlock {
    fn decode(stored: &[u8], compression_type: CompressionType) -> KkvResult<Self> {
        let data = decompress(stored, compression_type)?;
        if data.len() < SIZE_OF_U32 {
            return Err(KkvError::DecodeError("Invalid block".into()));
        }
        let count = (&data[data.len() - SIZE_OF_U32..]).get_u32_le() as usize;
        let offsets_len = (count + 1) * SIZE_OF_U32;
        if data.len() < offsets_len {
            return Err(KkvError::DecodeError("Invalid block".into()));
        }
        let entries_end = data.len() - offsets_len;
        let mut offsets = Vec::with_capacity(count);
        let mut raw = &data[entries_end..data.len() - SIZE_OF_U32];
        for _ in 0..count {
            let offset = raw.get_u32_le();
            if offset as usize + SIZE_OF_U64 > entries_end {
                return Err(KkvError::DecodeError("Invalid block offset".into()));
            }
            offsets.push(offset);
        }
        Ok(Self {
            data,
            offsets,
            entries_end,
        })
    }

    fn len(&self) -> usize {
        self.offsets.len()
    }

    fn pkey_at(&self, idx: usize) -> PKeyType {
        let start = self.offsets[idx] as usize;
        (&self.data[start..start + SIZE_OF_U64]).get_u64_le()
    }

    fn record_at(&self, idx: usize) -> Bytes {
        let start = self.offsets[idx] as usize + SIZE_OF_U64;
        let end = self
            .offsets
            .get(idx + 1)
            .map_or(self.entries_end, |&o| o as usize);
        self.data.slice(start..end.max(start))
    }

    fn find(&self, pkey: PKeyType) -> Option<usize> {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.pkey_at(mid) < pkey {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        (lo < self.len() && self.pkey_at(lo) == pkey).then_some(lo)
    }
}

type BlockCache = quick_cache::sync::Cache<usize, Arc<DiskBlock>>;

struct DiskShard {
    data: Bytes,
    meta: Vec<BlockMeta>,
    meta_offset: usize,
    block_cache: BlockCache,
}

impl std::fmt::Debug for DiskShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskShard")
            .field("data_len", &self.data.len())
            .field("blocks", &self.meta.len())
            .finish()
    }
}

impl DiskShard {
    /// Returns the shard and the header flags.
    fn import(bytes: Bytes, skey_size: usize) -> KkvResult<(Self, u8)> {
        if bytes.len() < HEADER_LEN + SIZE_OF_U32 {
            return Err(KkvError::DecodeError("Invalid shard bytes".into()));
        }
        let (magic_number, rest) = get_u32_le(&bytes)?;
        if magic_number != u32::from_le_bytes(MAGIC_BYTES) {
            return Err(KkvError::DecodeError("Invalid magic number".into()));
        }
        let (schema_version, rest) = get_u8_le(rest)?;
        if schema_version != CURRENT_SCHEMA_VERSION {
            return Err(KkvError::DecodeError(
                format!(
                    "Invalid schema version {}, current support max version is {}",
                    schema_version, CURRENT_SCHEMA_VERSION
                )
                .into(),
            ));
        }
        let (flags, rest) = get_u8_le(rest)?;
        let (stored_skey_size, _) = get_u8_le(rest)?;
        if stored_skey_size as usize != skey_size {
            return Err(KkvError::DecodeError(
                format!(
                    "skey size mismatch, stored {} but reading {}",
                    stored_skey_size, skey_size
                )
                .into(),
            ));
        }
        let data_len = bytes.len();
        let meta_offset = (&bytes[data_len - SIZE_OF_U32..]).get_u32_le() as usize;
        if meta_offset < HEADER_LEN || meta_offset >= data_len - SIZE_OF_U32 {
            return Err(KkvError::DecodeError("Invalid bytes".into()));
        }
        let meta = BlockMeta::decode_meta(&bytes[meta_offset..data_len - SIZE_OF_U32])?;
        Self::check_block_checksum(&meta, &bytes, meta_offset)?;
        Ok((
            Self {
                data: bytes,
                meta,
                meta_offset,
                block_cache: BlockCache::new(DEFAULT_BLOCK_CACHE_SIZE),
            },
            flags,
        ))
    }

    fn check_block_checksum(
        meta: &[BlockMeta],
        bytes: &Bytes,
        meta_offset: usize,
    ) -> KkvResult<()> {
        for i in 0..meta.len() {
            let offset = meta[i].offset;
            let offset_end = meta.get(i + 1).map_or(meta_offset, |m| m.offset);
            if offset_end > bytes.len() || offset + SIZE_OF_U32 > offset_end {
                return Err(KkvError::DecodeError("Invalid bytes".into()));
            }
            let raw_block_and_check = &bytes[offset..offset_end];
            let checksum =
                (&raw_block_and_check[raw_block_and_check.len() - SIZE_OF_U32..]).get_u32_le();
            if checksum
                != xxhash_rust::xxh32::xxh32(
                    &raw_block_and_check[..raw_block_and_check.len() - SIZE_OF_U32],
                    XXH_SEED,
                )
            {
                return Err(KkvError::DecodeChecksumMismatchError);
            }
        }
        Ok(())
    }

    fn find_block_idx(&self, pkey: PKeyType) -> Option<usize> {
        let idx = self
            .meta
            .partition_point(|meta| meta.first_pkey <= pkey)
            .checked_sub(1)?;
        (self.meta[idx].last_pkey >= pkey).then_some(idx)
    }

    fn read_block(&self, block_idx: usize) -> KkvResult<Arc<DiskBlock>> {
        let offset = self.meta[block_idx].offset;
        let offset_end = self
            .meta
            .get(block_idx + 1)
            .map_or(self.meta_offset, |m| m.offset);
        let stored = &self.data[offset..offset_end - SIZE_OF_U32];
        Ok(Arc::new(DiskBlock::decode(
            stored,
            self.meta[block_idx].compression_type,
        )?))
    }

    fn read_block_cached(&self, block_idx: usize) -> KkvResult<Arc<DiskBlock>> {
        self.block_cache
            .get_or_insert_with(&block_idx, || self.read_block(block_idx))
    }

    fn get(&self, pkey: PKeyType) -> KkvResult<Option<Bytes>> {
        let Some(block_idx) = self.find_block_idx(pkey) else {
            return Ok(None);
        };
        let block = self.read_block_cached(block_idx)?;
        Ok(block.find(pkey).map(|idx| block.record_at(idx)))
    }

    fn pkeys(&self) -> KkvResult<Vec<PKeyType>> {
        let mut ans = Vec::new();
        for block_idx in 0..self.meta.len() {
            let block = self.read_block_cached(block_idx)?;
            ans.extend((0..block.len()).map(|i| block.pkey_at(i)));
        }
        Ok(ans)
    }
}

/// Read side of a built KKV segment.
#[derive(Debug)]
pub struct KkvDiskIndexer<S> {
    shards: Vec<DiskShard>,
    store_expire_time: bool,
    _marker: PhantomData<fn() -> S>,
}

impl<S: SKeyType> KkvDiskIndexer<S> {
    pub fn builder(shard_count: u32, store_expire_time: bool) -> KkvDiskIndexerBuilder<S> {
        KkvDiskIndexerBuilder::new(shard_count, store_expire_time)
    }

    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn store_expire_time(&self) -> bool {
        self.store_expire_time
    }

    /// # Errors
    /// - [KkvError::DecodeChecksumMismatchError]
    /// - [KkvError::DecodeError] when a shard is malformed or the shards disagree
    pub fn import(shards: Vec<Bytes>) -> KkvResult<Self> {
        if shards.is_empty() || !(shards.len() as u32).is_power_of_two() {
            return Err(KkvError::DecodeError(
                format!("invalid shard file count {}", shards.len()).into(),
            ));
        }
        let mut store_expire_time = None;
        let mut ans = Vec::with_capacity(shards.len());
        for bytes in shards {
            let (shard, flags) = DiskShard::import(bytes, S::SIZE)?;
            let this = flags & FLAG_STORE_EXPIRE_TIME != 0;
            if *store_expire_time.get_or_insert(this) != this {
                return Err(KkvError::DecodeError("shards disagree on expire time".into()));
            }
            ans.push(shard);
        }
        Ok(Self {
            shards: ans,
            store_expire_time: store_expire_time.unwrap_or(false),
            _marker: PhantomData,
        })
    }

    pub fn export(&self) -> Vec<Bytes> {
        self.shards.iter().map(|s| s.data.clone()).collect()
    }

    pub fn data_size(&self) -> usize {
        self.shards.iter().map(|s| s.data.len()).sum()
    }

    pub fn fetch(&self, shard: ShardId, pkey: PKeyType) -> KkvResult<Option<PKeyDocs<S>>> {
        let Some(shard) = self.shards.get(shard as usize) else {
            return Ok(None);
        };
        match shard.get(pkey)? {
            Some(record) => decode_pkey_docs(&record, self.store_expire_time).map(Some),
            None => Ok(None),
        }
    }

    pub fn pkeys(&self, shard: ShardId) -> KkvResult<Vec<PKeyType>> {
        match self.shards.get(shard as usize) {
            Some(shard) => shard.pkeys(),
            None => Ok(Vec::new()),
        }
    }
}

struct ShardBuilder {
    block_builder: BlockBuilder,
    data: Vec<u8>,
    meta: Vec<BlockMeta>,
    last_pkey: Option<PKeyType>,
}

pub struct KkvDiskIndexerBuilder<S> {
    shards: Vec<ShardBuilder>,
    store_expire_time: bool,
    block_size: usize,
    compression_type: CompressionType,
    record_buf: Vec<u8>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: SKeyType> KkvDiskIndexerBuilder<S> {
    fn new(shard_count: u32, store_expire_time: bool) -> Self {
        let mut this = Self {
            shards: Vec::new(),
            store_expire_time,
            block_size: DEFAULT_BLOCK_SIZE,
            compression_type: CompressionType::LZ4,
            record_buf: Vec::new(),
            _marker: PhantomData,
        };
        let shards = (0..shard_count).map(|_| this.new_shard()).collect();
        this.shards = shards;
        this
    }

    fn new_shard(&self) -> ShardBuilder {
        let mut data = Vec::with_capacity(HEADER_LEN);
        data.put_u32_le(u32::from_le_bytes(MAGIC_BYTES));
        data.put_u8(CURRENT_SCHEMA_VERSION);
        data.put_u8(if self.store_expire_time {
            FLAG_STORE_EXPIRE_TIME
        } else {
            0
        });
        data.put_u8(S::SIZE as u8);
        ShardBuilder {
            block_builder: BlockBuilder::new(self.block_size),
            data,
            meta: Vec::new(),
            last_pkey: None,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        for shard in &mut self.shards {
            shard.block_builder.block_size = block_size;
        }
        self
    }

    pub fn with_compression(mut self, compression_type: CompressionType) -> Self {
        self.compression_type = compression_type;
        self
    }

    /// Pkeys of one shard must be added in ascending order.
    pub fn add(&mut self, shard: ShardId, pkey: PKeyType, docs: &PKeyDocs<S>) -> KkvResult<()> {
        let compression_type = self.compression_type;
        let block_size = self.block_size;
        let Some(builder) = self.shards.get_mut(shard as usize) else {
            return Err(KkvError::InvalidArgs(format!("shard {} out of range", shard).into()));
        };
        if builder.last_pkey.is_some_and(|last| last >= pkey) {
            return Err(KkvError::InvalidArgs(
                format!("pkey {} is not in ascending order", pkey).into(),
            ));
        }
        self.record_buf.clear();
        encode_pkey_docs(docs, self.store_expire_time, &mut self.record_buf);
        if !builder.block_builder.add(pkey, &self.record_buf) {
            Self::finish_block(builder, block_size, compression_type);
            let added = builder.block_builder.add(pkey, &self.record_buf);
            debug_assert!(added);
        }
        builder.last_pkey = Some(pkey);
        Ok(())
    }

    fn finish_block(
        builder: &mut ShardBuilder,
        block_size: usize,
        compression_type: CompressionType,
    ) {
        if builder.block_builder.is_empty() {
            return;
        }
        let block = std::mem::replace(&mut builder.block_builder, BlockBuilder::new(block_size));
        let offset = builder.data.len();
        let first_pkey = block.first_pkey;
        let last_pkey = block.last_pkey;
        let real_compression_type = block.encode(&mut builder.data, compression_type);
        builder.meta.push(BlockMeta {
            offset,
            first_pkey,
            last_pkey,
            compression_type: real_compression_type,
        });
    }

    pub fn build(mut self) -> KkvDiskIndexer<S> {
        let mut shards = Vec::with_capacity(self.shards.len());
        for mut builder in std::mem::take(&mut self.shards) {
            Self::finish_block(&mut builder, self.block_size, self.compression_type);
            let mut buf = builder.data;
            let meta_offset = buf.len();
            BlockMeta::encode_meta(&builder.meta, &mut buf);
            buf.put_u32_le(meta_offset as u32);
            shards.push(DiskShard {
                data: Bytes::from(buf),
                meta: builder.meta,
                meta_offset,
                block_cache: BlockCache::new(DEFAULT_BLOCK_CACHE_SIZE),
            });
        }
        KkvDiskIndexer {
            shards,
            store_expire_time: self.store_expire_time,
            _marker: PhantomData,
        }
    }
}
