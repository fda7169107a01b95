//! Segments and the tablet that orders them.
//!
//! A building segment holds live writes in memory. Once dumped it becomes a
//! built segment: an immutable block file per shard. Readers only see
//! segments through [TabletData], which keeps them in build order.
use std::{any::Any, fmt::Debug, sync::Arc};

use kkv_common::{KkvResult, Locator, PKeyType, SchemaId, SegmentId, ShardId};
use rustc_hash::FxHashMap;

use crate::types::{KkvDoc, SKeyType};

pub mod building;
pub mod built;

pub use building::KkvMemIndexer;
pub use built::KkvDiskIndexer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentStatus {
    Building,
    Dumping,
    Built,
}

impl SegmentStatus {
    pub fn is_in_memory(&self) -> bool {
        matches!(self, SegmentStatus::Building | SegmentStatus::Dumping)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    Kkv,
    Kv,
    Attribute,
}

pub type AnyIndexer = Arc<dyn Any + Send + Sync>;

pub struct Segment {
    id: SegmentId,
    status: SegmentStatus,
    schema_id: SchemaId,
    locator: Locator,
    indexers: FxHashMap<(IndexType, String), AnyIndexer>,
}

impl Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("schema_id", &self.schema_id)
            .field("locator", &self.locator)
            .field("indexers", &self.indexers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Segment {
    pub fn new(
        id: SegmentId,
        status: SegmentStatus,
        schema_id: SchemaId,
        locator: Locator,
    ) -> Self {
        Self {
            id,
            status,
            schema_id,
            locator,
            indexers: FxHashMap::default(),
        }
    }

    pub fn with_indexer<T: Any + Send + Sync>(
        mut self,
        index_type: IndexType,
        name: impl Into<String>,
        indexer: Arc<T>,
    ) -> Self {
        self.indexers.insert((index_type, name.into()), indexer);
        self
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn status(&self) -> SegmentStatus {
        self.status
    }

    pub fn schema_id(&self) -> SchemaId {
        self.schema_id
    }

    pub fn locator(&self) -> Locator {
        self.locator
    }

    pub fn get_indexer(&self, index_type: IndexType, name: &str) -> Option<&AnyIndexer> {
        // TODO: key the map by (IndexType, Box<str>) and look up without allocating
        self.indexers.get(&(index_type, name.to_owned()))
    }
}

/// Segments of one tablet, ordered by build order (oldest first).
#[derive(Debug, Default, Clone)]
pub struct TabletData {
    segments: Vec<Arc<Segment>>,
}

impl TabletData {
    pub fn new(mut segments: Vec<Arc<Segment>>) -> Self {
        segments.sort_by_key(|s| s.id());
        Self { segments }
    }

    pub fn add_segment(&mut self, segment: Segment) {
        let segment = Arc::new(segment);
        let pos = self.segments.partition_point(|s| s.id() < segment.id());
        self.segments.insert(pos, segment);
    }

    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    pub fn segments_with_status(
        &self,
        status: SegmentStatus,
    ) -> impl Iterator<Item = &Arc<Segment>> {
        self.segments.iter().filter(move |s| s.status() == status)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Records of one pkey inside one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PKeyDocs<S> {
    /// Timestamp of the pkey tombstone. Docs older than it were dropped.
    pub deleted_ts: Option<u32>,
    pub docs: Vec<KkvDoc<S>>,
}

impl<S> Default for PKeyDocs<S> {
    fn default() -> Self {
        Self {
            deleted_ts: None,
            docs: Vec::new(),
        }
    }
}

impl<S> PKeyDocs<S> {
    pub fn is_pkey_deleted(&self) -> bool {
        self.deleted_ts.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct BuildingSegmentReader<S: SKeyType> {
    pub(crate) segment_id: SegmentId,
    pub(crate) shard: ShardId,
    pub(crate) indexer: Arc<KkvMemIndexer<S>>,
}

#[derive(Debug, Clone)]
pub struct BuiltSegmentReader<S: SKeyType> {
    pub(crate) segment_id: SegmentId,
    pub(crate) shard: ShardId,
    pub(crate) locator: Locator,
    pub(crate) indexer: Arc<KkvDiskIndexer<S>>,
}

/// One segment's view of a shard.
#[derive(Debug, Clone)]
pub enum SegmentReader<S: SKeyType> {
    Building(BuildingSegmentReader<S>),
    Built(BuiltSegmentReader<S>),
}

impl<S: SKeyType> SegmentReader<S> {
    pub fn segment_id(&self) -> SegmentId {
        match self {
            SegmentReader::Building(r) => r.segment_id,
            SegmentReader::Built(r) => r.segment_id,
        }
    }

    pub fn is_building(&self) -> bool {
        matches!(self, SegmentReader::Building(_))
    }

    /// Invalid while the segment is still in memory.
    pub fn locator(&self) -> Locator {
        match self {
            SegmentReader::Building(_) => Locator::invalid(),
            SegmentReader::Built(r) => r.locator,
        }
    }

    pub fn fetch(&self, pkey: PKeyType) -> KkvResult<Option<PKeyDocs<S>>> {
        match self {
            SegmentReader::Building(r) => Ok(r.indexer.fetch(r.shard, pkey)),
            SegmentReader::Built(r) => r.indexer.fetch(r.shard, pkey),
        }
    }

    /// Same as [Self::fetch], suspending at the segment boundary.
    pub async fn fetch_async(&self, pkey: PKeyType) -> KkvResult<Option<PKeyDocs<S>>> {
        futures::future::lazy(|_| self.fetch(pkey)).await
    }

    pub fn pkeys(&self) -> KkvResult<Vec<PKeyType>> {
        match self {
            SegmentReader::Building(r) => Ok(r.indexer.pkeys(r.shard)),
            SegmentReader::Built(r) => r.indexer.pkeys(r.shard),
        }
    }
}

impl<S: SKeyType> From<BuildingSegmentReader<S>> for SegmentReader<S> {
    fn from(value: BuildingSegmentReader<S>) -> Self {
        SegmentReader::Building(value)
    }
}

impl<S: SKeyType> From<BuiltSegmentReader<S>> for SegmentReader<S> {
    fn from(value: BuiltSegmentReader<S>) -> Self {
        SegmentReader::Built(value)
    }
}
