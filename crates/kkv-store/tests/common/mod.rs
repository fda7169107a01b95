#![allow(dead_code)]
use std::sync::Arc;

use bytes::Bytes;
use kkv_common::{Locator, SegmentId};
use kkv_store::{
    config::{FieldConfig, FieldType, KkvIndexConfig},
    segment::{IndexType, Segment, SegmentStatus, TabletData},
    KkvIterator, KkvMemIndexer,
};

pub const SEC: u64 = 1_000_000;

pub fn config() -> KkvIndexConfig {
    KkvIndexConfig::new(
        "kkv",
        FieldConfig::new("pkey", FieldType::UInt64),
        FieldConfig::new("skey", FieldType::UInt32),
    )
}

/// Segments are numbered in the order they are added. A built segment with
/// id `n` carries locator `0:n+1`.
pub struct TabletBuilder {
    config: KkvIndexConfig,
    segments: Vec<Arc<Segment>>,
}

impl TabletBuilder {
    pub fn new(config: KkvIndexConfig) -> Self {
        Self {
            config,
            segments: Vec::new(),
        }
    }

    fn next_id(&self) -> SegmentId {
        self.segments.len() as SegmentId
    }

    pub fn building(mut self, write: impl FnOnce(&KkvMemIndexer<u32>)) -> Self {
        let indexer = Arc::new(KkvMemIndexer::<u32>::new(&self.config).unwrap());
        write(&indexer);
        let id = self.next_id();
        self.segments.push(Arc::new(
            Segment::new(id, SegmentStatus::Building, self.config.schema_id, Locator::invalid())
                .with_indexer(IndexType::Kkv, self.config.index_name.clone(), indexer),
        ));
        self
    }

    pub fn built(mut self, write: impl FnOnce(&KkvMemIndexer<u32>)) -> Self {
        let indexer = KkvMemIndexer::<u32>::new(&self.config).unwrap();
        write(&indexer);
        let id = self.next_id();
        self.segments.push(Arc::new(
            Segment::new(
                id,
                SegmentStatus::Built,
                self.config.schema_id,
                Locator::new(0, id as i64 + 1),
            )
            .with_indexer(
                IndexType::Kkv,
                self.config.index_name.clone(),
                Arc::new(indexer.dump().unwrap()),
            ),
        ));
        self
    }

    pub fn tablet(&self) -> TabletData {
        TabletData::new(self.segments.clone())
    }
}

pub fn values(iter: KkvIterator<u32>) -> Vec<(u32, Bytes)> {
    iter.collect_values().unwrap()
}

pub fn sorted(mut v: Vec<(u32, Bytes)>) -> Vec<(u32, Bytes)> {
    v.sort();
    v
}

pub fn kv(skey: u32, value: &'static str) -> (u32, Bytes) {
    (skey, Bytes::from_static(value.as_bytes()))
}
