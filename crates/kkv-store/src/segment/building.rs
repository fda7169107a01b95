use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use kkv_common::{micro_to_sec, KkvError, KkvResult, PKeyType, ShardId, UNINITIALIZED_EXPIRE_TIME};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{
    config::{KkvIndexConfig, SortField, SortOrder, SortParam},
    plain_format::PlainFormatEncoder,
    segment::{built::KkvDiskIndexer, PKeyDocs},
    shard::ShardPartitioner,
    types::{KkvDoc, SKeyType},
};

#[derive(Debug, Clone)]
struct SKeyRecord<S> {
    skey: S,
    timestamp: u32,
    expire_time: u32,
    value: Bytes,
    deleted: bool,
}

impl<S: SKeyType> SKeyRecord<S> {
    fn to_doc(&self) -> KkvDoc<S> {
        KkvDoc {
            skey: self.skey,
            timestamp: self.timestamp,
            expire_time: self.expire_time,
            value: self.value.clone(),
            skey_deleted: self.deleted,
            duplicated_key: false,
            in_cache: false,
        }
    }
}

/// Skeys of one pkey in write order. Rewriting a skey keeps its slot.
#[derive(Debug, Clone)]
struct PKeyNode<S> {
    deleted_ts: Option<u32>,
    records: Vec<SKeyRecord<S>>,
    positions: FxHashMap<S, usize>,
}

impl<S: SKeyType> PKeyNode<S> {
    fn new() -> Self {
        Self {
            deleted_ts: None,
            records: Vec::new(),
            positions: FxHashMap::default(),
        }
    }

    fn upsert(&mut self, record: SKeyRecord<S>) {
        match self.positions.get(&record.skey) {
            Some(&pos) => self.records[pos] = record,
            None => {
                self.positions.insert(record.skey, self.records.len());
                self.records.push(record);
            }
        }
    }

    fn delete_all(&mut self, ts: u32) {
        self.deleted_ts = Some(ts);
        self.records.clear();
        self.positions.clear();
    }

    fn to_docs(&self) -> PKeyDocs<S> {
        PKeyDocs {
            deleted_ts: self.deleted_ts,
            docs: self.records.iter().map(|r| r.to_doc()).collect(),
        }
    }
}

#[derive(Debug)]
struct MemShard<S> {
    pkeys: FxHashMap<PKeyType, PKeyNode<S>>,
}

/// In-memory KKV index of a building segment.
///
/// Writes and reads may happen concurrently, every shard is guarded by its
/// own lock.
#[derive(Debug)]
pub struct KkvMemIndexer<S> {
    shards: Vec<RwLock<MemShard<S>>>,
    partitioner: ShardPartitioner,
    encoder: Option<PlainFormatEncoder>,
    fixed_value_len: Option<u32>,
    store_expire_time: bool,
    sort_params: Option<Vec<SortParam>>,
    doc_count: AtomicUsize,
}

impl<S: SKeyType> KkvMemIndexer<S> {
    pub fn new(config: &KkvIndexConfig) -> KkvResult<Self> {
        config.validate()?;
        if !S::accepts(config.suffix_key.field_type) {
            return Err(KkvError::ConfigError(
                format!(
                    "suffix key {:?} cannot be stored as a {} bytes skey",
                    config.suffix_key.field_type,
                    S::SIZE
                )
                .into(),
            ));
        }
        let partitioner = ShardPartitioner::new(config.shard_count, config.hash_function)?;
        let shards = (0..config.shard_count)
            .map(|_| {
                RwLock::new(MemShard {
                    pkeys: FxHashMap::default(),
                })
            })
            .collect();
        Ok(Self {
            shards,
            partitioner,
            encoder: PlainFormatEncoder::new(config.value_compression.into()),
            fixed_value_len: config.fixed_value_len,
            store_expire_time: config.store_expire_time,
            sort_params: if config.enable_sort_skey {
                Some(config.sort_params.clone())
            } else {
                None
            },
            doc_count: AtomicUsize::new(0),
        })
    }

    pub fn shard_count(&self) -> u32 {
        self.partitioner.shard_count()
    }

    pub fn doc_count(&self) -> usize {
        self.doc_count.load(Ordering::Relaxed)
    }

    pub fn store_expire_time(&self) -> bool {
        self.store_expire_time
    }

    pub(crate) fn partitioner(&self) -> &ShardPartitioner {
        &self.partitioner
    }

    fn shard(&self, pkey: PKeyType) -> &RwLock<MemShard<S>> {
        &self.shards[self.partitioner.get_shard_idx(pkey) as usize]
    }

    /// Adds a value. `ts_us` is in microseconds, `expire_time` in seconds.
    pub fn add(
        &self,
        pkey: PKeyType,
        skey: S,
        value: &[u8],
        ts_us: u64,
        expire_time: u32,
    ) -> KkvResult<()> {
        if let Some(len) = self.fixed_value_len {
            if value.len() != len as usize {
                return Err(KkvError::InvalidArgs(
                    format!("value length {} does not match fixed length {}", value.len(), len)
                        .into(),
                ));
            }
        }
        let value = match &self.encoder {
            Some(encoder) => encoder.encode(value),
            None => Bytes::copy_from_slice(value),
        };
        let record = SKeyRecord {
            skey,
            timestamp: micro_to_sec(ts_us),
            expire_time: if self.store_expire_time {
                expire_time
            } else {
                UNINITIALIZED_EXPIRE_TIME
            },
            value,
            deleted: false,
        };
        trace!(pkey, ?skey, ts = record.timestamp, "add");
        self.shard(pkey)
            .write()
            .pkeys
            .entry(pkey)
            .or_insert_with(PKeyNode::new)
            .upsert(record);
        self.doc_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn delete_skey(&self, pkey: PKeyType, skey: S, ts_us: u64) {
        let record = SKeyRecord {
            skey,
            timestamp: micro_to_sec(ts_us),
            expire_time: UNINITIALIZED_EXPIRE_TIME,
            value: Bytes::new(),
            deleted: true,
        };
        trace!(pkey, ?skey, ts = record.timestamp, "delete skey");
        self.shard(pkey)
            .write()
            .pkeys
            .entry(pkey)
            .or_insert_with(PKeyNode::new)
            .upsert(record);
        self.doc_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops everything written for `pkey` so far and leaves a tombstone
    /// that hides older segments.
    pub fn delete_pkey(&self, pkey: PKeyType, ts_us: u64) {
        let ts = micro_to_sec(ts_us);
        trace!(pkey, ts, "delete pkey");
        self.shard(pkey)
            .write()
            .pkeys
            .entry(pkey)
            .or_insert_with(PKeyNode::new)
            .delete_all(ts);
        self.doc_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch(&self, shard: ShardId, pkey: PKeyType) -> Option<PKeyDocs<S>> {
        let shard = self.shards.get(shard as usize)?;
        shard.read().pkeys.get(&pkey).map(|node| node.to_docs())
    }

    pub fn pkeys(&self, shard: ShardId) -> Vec<PKeyType> {
        match self.shards.get(shard as usize) {
            Some(shard) => {
                let mut ans: Vec<_> = shard.read().pkeys.keys().copied().collect();
                ans.sort_unstable();
                ans
            }
            None => Vec::new(),
        }
    }

    /// Freezes the current content into a built segment.
    pub fn dump(&self) -> KkvResult<KkvDiskIndexer<S>> {
        let mut builder = KkvDiskIndexer::builder(self.shard_count(), self.store_expire_time);
        for (shard_idx, shard) in self.shards.iter().enumerate() {
            let shard = shard.read();
            let mut pkeys: Vec<_> = shard.pkeys.keys().copied().collect();
            pkeys.sort_unstable();
            for pkey in pkeys {
                let mut docs = shard.pkeys[&pkey].to_docs();
                if let Some(params) = &self.sort_params {
                    sort_docs(&mut docs.docs, params);
                }
                builder.add(shard_idx as ShardId, pkey, &docs)?;
            }
        }
        Ok(builder.build())
    }
}

pub(crate) fn sort_docs<S: SKeyType>(docs: &mut [KkvDoc<S>], params: &[SortParam]) {
    docs.sort_by(|a, b| {
        for p in params {
            let ord = match p.field {
                SortField::SKey => a.skey.cmp(&b.skey),
                SortField::Timestamp => a.timestamp.cmp(&b.timestamp),
            };
            let ord = match p.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            if ord.is_ne() {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldConfig, FieldType};

    fn config() -> KkvIndexConfig {
        let mut config = KkvIndexConfig::new(
            "kkv",
            FieldConfig::new("pkey", FieldType::UInt64),
            FieldConfig::new("skey", FieldType::UInt32),
        );
        config.shard_count = 2;
        config
    }

    #[test]
    fn rewrite_keeps_position() {
        let indexer = KkvMemIndexer::<u32>::new(&config()).unwrap();
        indexer.add(1, 5, b"a", 1_000_000, 0).unwrap();
        indexer.add(1, 6, b"b", 2_000_000, 0).unwrap();
        indexer.add(1, 5, b"c", 3_000_000, 0).unwrap();
        let docs = indexer.fetch(1, 1).unwrap();
        assert_eq!(docs.deleted_ts, None);
        let got: Vec<_> = docs
            .docs
            .iter()
            .map(|d| (d.skey, d.value.clone(), d.timestamp))
            .collect();
        assert_eq!(
            got,
            vec![(5, Bytes::from_static(b"c"), 3), (6, Bytes::from_static(b"b"), 2)]
        );
        assert_eq!(indexer.doc_count(), 3);
        assert!(indexer.fetch(0, 1).is_none());
    }

    #[test]
    fn delete_pkey_drops_older_records() {
        let indexer = KkvMemIndexer::<u32>::new(&config()).unwrap();
        indexer.add(3, 1, b"a", 1_000_000, 0).unwrap();
        indexer.delete_pkey(3, 2_000_000);
        indexer.add(3, 2, b"b", 3_000_000, 0).unwrap();
        indexer.delete_skey(3, 9, 4_000_000);
        let docs = indexer.fetch(1, 3).unwrap();
        assert_eq!(docs.deleted_ts, Some(2));
        assert_eq!(docs.docs.len(), 2);
        assert_eq!(docs.docs[0].skey, 2);
        assert!(docs.docs[1].skey_deleted);
    }

    #[test]
    fn fixed_value_len() {
        let mut config = config();
        config.fixed_value_len = Some(4);
        let indexer = KkvMemIndexer::<u32>::new(&config).unwrap();
        assert!(indexer.add(1, 1, b"abcd", 0, 0).is_ok());
        assert!(matches!(
            indexer.add(1, 1, b"abc", 0, 0),
            Err(KkvError::InvalidArgs(_))
        ));
    }

    #[test]
    fn skey_type_must_match() {
        assert!(matches!(
            KkvMemIndexer::<u64>::new(&config()),
            Err(KkvError::ConfigError(_))
        ));
    }

    #[test]
    fn expire_time_only_when_stored() {
        let mut config = config();
        let indexer = KkvMemIndexer::<u32>::new(&config).unwrap();
        indexer.add(0, 1, b"a", 0, 100).unwrap();
        assert_eq!(indexer.fetch(0, 0).unwrap().docs[0].expire_time, 0);
        config.store_expire_time = true;
        let indexer = KkvMemIndexer::<u32>::new(&config).unwrap();
        indexer.add(0, 1, b"a", 0, 100).unwrap();
        assert_eq!(indexer.fetch(0, 0).unwrap().docs[0].expire_time, 100);
    }

    #[test]
    fn sort_by_params() {
        let mut docs = vec![
            KkvDoc::new(3u32, 1, Bytes::new()),
            KkvDoc::new(1u32, 2, Bytes::new()),
            KkvDoc::new(2u32, 2, Bytes::new()),
        ];
        sort_docs(
            &mut docs,
            &[
                SortParam {
                    field: SortField::Timestamp,
                    order: SortOrder::Desc,
                },
                SortParam {
                    field: SortField::SKey,
                    order: SortOrder::Asc,
                },
            ],
        );
        let skeys: Vec<_> = docs.iter().map(|d| d.skey).collect();
        assert_eq!(skeys, vec![1, 2, 3]);
    }
}
