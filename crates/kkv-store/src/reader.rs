//! Lookup entry points of a KKV index.
//!
//! [KkvReader] captures the segment readers of a tablet once, per shard.
//! In-memory readers are kept oldest first, built readers newest first, and
//! both per-shard vectors always have `shard_count` entries even when a side
//! holds no segment.
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use kkv_common::{
    hash::{hash64, number_hash},
    micro_to_sec, KkvError, KkvResult, PKeyType, SegmentId, ShardId,
};
use tracing::{debug, instrument, warn};

use crate::{
    cache_context::SearchCacheContext,
    config::{FieldType, KkvIndexConfig},
    iter::{KkvIterator, KkvIteratorImpl, MergedDocIter, SegmentDocIter, DEFAULT_BATCH_SIZE},
    metrics::KkvMetricsCollector,
    options::KkvIndexOptions,
    record_iter::KkvShardRecordIterator,
    search::{KkvSearch, TimeoutTerminator},
    search_cache::SearchCache,
    segment::{
        BuildingSegmentReader, BuiltSegmentReader, IndexType, KkvDiskIndexer, KkvMemIndexer,
        PKeyDocs, SegmentReader, SegmentStatus, TabletData,
    },
    shard::ShardPartitioner,
    types::SKeyType,
};

#[derive(Debug, Clone)]
pub struct LookupOptions {
    /// Microseconds since the epoch.
    pub current_ts: u64,
    /// Serve from in-memory segments and the search cache only.
    pub only_cache: bool,
    pub timeout: Option<TimeoutTerminator>,
    pub batch_size: usize,
}

impl Default for LookupOptions {
    fn default() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self::at(now)
    }
}

impl LookupOptions {
    pub fn at(current_ts: u64) -> Self {
        Self {
            current_ts,
            only_cache: false,
            timeout: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_only_cache(mut self, only_cache: bool) -> Self {
        self.only_cache = only_cache;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutTerminator) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// A lookup by raw, unhashed keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawQuery<'a> {
    pub pkey: &'a str,
    pub skeys: Vec<&'a str>,
}

impl<'a> RawQuery<'a> {
    pub fn new(pkey: &'a str) -> Self {
        Self {
            pkey,
            skeys: Vec::new(),
        }
    }

    pub fn with_skeys(mut self, skeys: impl IntoIterator<Item = &'a str>) -> Self {
        self.skeys = skeys.into_iter().collect();
        self
    }
}

#[derive(Debug)]
pub struct KkvReader<S: SKeyType> {
    config: Arc<KkvIndexConfig>,
    options: KkvIndexOptions,
    partitioner: ShardPartitioner,
    mem_shard_readers: Vec<Vec<SegmentReader<S>>>,
    disk_shard_readers: Vec<Vec<SegmentReader<S>>>,
    skey_field_name: Arc<str>,
}

fn check_shard_count(
    seen: &mut Option<u32>,
    segment_id: SegmentId,
    shard_count: u32,
) -> KkvResult<()> {
    match *seen {
        Some(expected) if expected != shard_count => Err(KkvError::InternalError(
            format!(
                "segment {} has {} shards, previous segments have {}",
                segment_id, shard_count, expected
            )
            .into(),
        )),
        _ => {
            *seen = Some(shard_count);
            Ok(())
        }
    }
}

impl<S: SKeyType> KkvReader<S> {
    /// # Errors
    /// - [KkvError::ConfigError]/[KkvError::InvalidArgs] when the config is unusable
    /// - [KkvError::InternalError] when a segment belongs to another schema,
    ///   lacks the index, holds an indexer of another type, or disagrees on
    ///   the shard count
    #[instrument(skip_all, fields(index = %config.index_name, segments = tablet.len()))]
    pub fn open(config: Arc<KkvIndexConfig>, tablet: &TabletData) -> KkvResult<Self> {
        config.validate()?;
        if !S::accepts(config.suffix_key.field_type) {
            return Err(KkvError::ConfigError(
                format!(
                    "suffix key {:?} cannot be read as a {} bytes skey",
                    config.suffix_key.field_type,
                    S::SIZE
                )
                .into(),
            ));
        }

        let mut shard_count = None;
        let mut mem = Vec::new();
        let mut disk = Vec::new();
        for segment in tablet.segments() {
            if segment.schema_id() != config.schema_id {
                return Err(KkvError::InternalError(
                    format!(
                        "segment {} has schema {}, reader is bound to schema {}",
                        segment.id(),
                        segment.schema_id(),
                        config.schema_id
                    )
                    .into(),
                ));
            }
            let indexer = segment
                .get_indexer(IndexType::Kkv, &config.index_name)
                .ok_or_else(|| {
                    KkvError::InternalError(
                        format!(
                            "segment {} has no kkv index {}",
                            segment.id(),
                            config.index_name
                        )
                        .into(),
                    )
                })?
                .clone();
            let bad_cast = || {
                KkvError::InternalError(
                    format!(
                        "segment {} holds an indexer of an unexpected type for {:?}",
                        segment.id(),
                        segment.status()
                    )
                    .into(),
                )
            };
            match segment.status() {
                SegmentStatus::Building | SegmentStatus::Dumping => {
                    let indexer = indexer.downcast::<KkvMemIndexer<S>>().map_err(|_| bad_cast())?;
                    check_shard_count(&mut shard_count, segment.id(), indexer.shard_count())?;
                    mem.push((segment.id(), indexer));
                }
                SegmentStatus::Built => {
                    let indexer = indexer.downcast::<KkvDiskIndexer<S>>().map_err(|_| bad_cast())?;
                    check_shard_count(&mut shard_count, segment.id(), indexer.shard_count())?;
                    disk.push((segment.id(), segment.locator(), indexer));
                }
            }
        }
        // built readers are walked newest first
        disk.reverse();

        let shard_count = shard_count.unwrap_or(config.shard_count);
        let partitioner = ShardPartitioner::new(shard_count, config.hash_function)?;
        let mem_shard_readers = (0..shard_count)
            .map(|shard| {
                mem.iter()
                    .map(|(segment_id, indexer)| {
                        SegmentReader::from(BuildingSegmentReader {
                            segment_id: *segment_id,
                            shard,
                            indexer: indexer.clone(),
                        })
                    })
                    .collect()
            })
            .collect();
        let disk_shard_readers = (0..shard_count)
            .map(|shard| {
                disk.iter()
                    .map(|(segment_id, locator, indexer)| {
                        SegmentReader::from(BuiltSegmentReader {
                            segment_id: *segment_id,
                            shard,
                            locator: *locator,
                            indexer: indexer.clone(),
                        })
                    })
                    .collect()
            })
            .collect();
        debug!(
            shard_count,
            mem_segments = mem.len(),
            disk_segments = disk.len(),
            "kkv reader opened"
        );
        Ok(Self {
            options: KkvIndexOptions::new(&config, tablet),
            skey_field_name: config.skey_field_name().into(),
            config,
            partitioner,
            mem_shard_readers,
            disk_shard_readers,
        })
    }

    pub fn config(&self) -> &Arc<KkvIndexConfig> {
        &self.config
    }

    pub fn options(&self) -> &KkvIndexOptions {
        &self.options
    }

    pub fn shard_count(&self) -> u32 {
        self.partitioner.shard_count()
    }

    pub fn lookup(
        &self,
        pkey: PKeyType,
        skeys: &[S],
        options: &LookupOptions,
    ) -> KkvResult<KkvIterator<S>> {
        self.lookup_impl(pkey, skeys, options, None)
    }

    pub async fn lookup_async(
        &self,
        pkey: PKeyType,
        skeys: &[S],
        options: &LookupOptions,
    ) -> KkvResult<KkvIterator<S>> {
        self.lookup_async_impl(pkey, skeys, options, None).await
    }

    /// One iterator per query, in order. A malformed key only empties its
    /// own iterator.
    pub fn batch_lookup(
        &self,
        queries: &[RawQuery<'_>],
        options: &LookupOptions,
    ) -> Vec<KkvResult<KkvIterator<S>>> {
        self.batch_lookup_impl(queries, options, None)
    }

    /// Deduplicated live records of one shard, for export.
    pub fn shard_record_iterator(
        &self,
        shard: ShardId,
        current_ts: u64,
    ) -> KkvResult<KkvShardRecordIterator<S>> {
        let (mem, disk) = self
            .mem_shard_readers
            .get(shard as usize)
            .zip(self.disk_shard_readers.get(shard as usize))
            .ok_or_else(|| KkvError::InvalidArgs(format!("shard {} out of range", shard).into()))?;
        let current_ts = micro_to_sec(current_ts);
        KkvShardRecordIterator::new(
            mem.clone(),
            disk.clone(),
            self.options.encoder,
            self.options.min_timestamp(current_ts),
            current_ts,
        )
    }

    pub fn hash_pkey(&self, raw: &str) -> KkvResult<PKeyType> {
        self.partitioner.hash_key(raw)
    }

    /// String skeys are hashed, integer skeys are parsed.
    pub fn hash_skey(&self, raw: &str) -> KkvResult<S> {
        match self.config.suffix_key.field_type {
            FieldType::String => Ok(S::from_hash(hash64(raw.as_bytes()))),
            _ => number_hash(raw).map(S::from_hash).ok_or_else(|| {
                KkvError::InvalidArgs(format!("skey [{}] is not a number", raw).into())
            }),
        }
    }

    fn shard_readers(&self, pkey: PKeyType) -> (&[SegmentReader<S>], &[SegmentReader<S>]) {
        let shard = self.partitioner.get_shard_idx(pkey) as usize;
        (&self.mem_shard_readers[shard], &self.disk_shard_readers[shard])
    }

    fn iterator(
        &self,
        inner: Option<KkvIteratorImpl<S>>,
        options: &LookupOptions,
        metrics: Arc<KkvMetricsCollector>,
    ) -> KkvIterator<S> {
        KkvIterator::new(
            inner,
            &self.options,
            self.skey_field_name.clone(),
            options.batch_size,
            metrics,
        )
    }

    fn single_segment_iter(
        &self,
        reader: &SegmentReader<S>,
        fetched: Option<PKeyDocs<S>>,
        skeys: &[S],
        current_ts: u32,
    ) -> Option<KkvIteratorImpl<S>> {
        let docs = fetched?;
        let iter = SegmentDocIter::new(
            docs,
            skeys,
            self.options.min_timestamp(current_ts),
            current_ts,
            self.options.skey_count_limit,
        );
        Some(if reader.is_building() {
            KkvIteratorImpl::Building(iter)
        } else {
            KkvIteratorImpl::Built(iter)
        })
    }

    fn search<'a>(
        &'a self,
        pkey: PKeyType,
        skeys: &[S],
        options: &'a LookupOptions,
        cache: Option<&'a SearchCacheContext<S>>,
        metrics: &'a KkvMetricsCollector,
    ) -> KkvSearch<'a, S> {
        let (mem, disk) = self.shard_readers(pkey);
        let current_ts = micro_to_sec(options.current_ts);
        KkvSearch::new(pkey, mem, disk, metrics)
            .with_skeys(skeys)
            .with_time(self.options.min_timestamp(current_ts), current_ts)
            .with_limit(self.options.skey_count_limit)
            .with_timeout(options.timeout.as_ref())
            .with_cache(cache)
            .with_encoder(self.options.encoder.as_ref())
    }

    fn cache_context(
        &self,
        cache: Option<&Arc<SearchCache>>,
        pkey: PKeyType,
        skeys: &[S],
        options: &LookupOptions,
        metrics: &KkvMetricsCollector,
    ) -> Option<SearchCacheContext<S>> {
        cache.map(|cache| {
            SearchCacheContext::new(
                cache.clone(),
                pkey,
                Some(skeys),
                options.only_cache,
                self.options.cache_priority,
                metrics,
            )
        })
    }

    /// The only reader of the shard, when nothing needs merging.
    fn sole_reader<'a>(
        &self,
        mem: &'a [SegmentReader<S>],
        disk: &'a [SegmentReader<S>],
    ) -> Option<&'a SegmentReader<S>> {
        match (mem, disk) {
            ([reader], []) | ([], [reader]) => Some(reader),
            _ => None,
        }
    }

    fn lookup_impl(
        &self,
        pkey: PKeyType,
        skeys: &[S],
        options: &LookupOptions,
        cache: Option<&Arc<SearchCache>>,
    ) -> KkvResult<KkvIterator<S>> {
        let metrics = KkvMetricsCollector::new();
        let (mem, disk) = self.shard_readers(pkey);
        if mem.is_empty() && disk.is_empty() {
            return Ok(self.iterator(None, options, metrics));
        }
        let inner = match (cache, self.sole_reader(mem, disk)) {
            (None, Some(reader)) => {
                metrics.inc_segments_searched(1);
                let fetched = reader.fetch(pkey)?;
                self.single_segment_iter(reader, fetched, skeys, micro_to_sec(options.current_ts))
            }
            _ => {
                let ctx = self.cache_context(cache, pkey, skeys, options, &metrics);
                let out = self.search(pkey, skeys, options, ctx.as_ref(), &metrics).run()?;
                Some(KkvIteratorImpl::Merged(MergedDocIter::new(out.docs)))
            }
        };
        Ok(self.iterator(inner, options, metrics))
    }

    async fn lookup_async_impl(
        &self,
        pkey: PKeyType,
        skeys: &[S],
        options: &LookupOptions,
        cache: Option<&Arc<SearchCache>>,
    ) -> KkvResult<KkvIterator<S>> {
        let metrics = KkvMetricsCollector::new();
        let (mem, disk) = self.shard_readers(pkey);
        if mem.is_empty() && disk.is_empty() {
            return Ok(self.iterator(None, options, metrics));
        }
        let inner = match (cache, self.sole_reader(mem, disk)) {
            (None, Some(reader)) => {
                metrics.inc_segments_searched(1);
                let fetched = reader.fetch_async(pkey).await?;
                self.single_segment_iter(reader, fetched, skeys, micro_to_sec(options.current_ts))
            }
            _ => {
                let ctx = self.cache_context(cache, pkey, skeys, options, &metrics);
                let out = self
                    .search(pkey, skeys, options, ctx.as_ref(), &metrics)
                    .run_async()
                    .await?;
                Some(KkvIteratorImpl::Merged(MergedDocIter::new(out.docs)))
            }
        };
        Ok(self.iterator(inner, options, metrics))
    }

    fn batch_lookup_impl(
        &self,
        queries: &[RawQuery<'_>],
        options: &LookupOptions,
        cache: Option<&Arc<SearchCache>>,
    ) -> Vec<KkvResult<KkvIterator<S>>> {
        queries
            .iter()
            .map(|query| {
                let hashed = self.hash_pkey(query.pkey).and_then(|pkey| {
                    let skeys = query
                        .skeys
                        .iter()
                        .map(|raw| self.hash_skey(raw))
                        .collect::<KkvResult<Vec<S>>>()?;
                    Ok((pkey, skeys))
                });
                match hashed {
                    Ok((pkey, skeys)) => self.lookup_impl(pkey, &skeys, options, cache),
                    Err(e) => {
                        warn!(pkey = query.pkey, "skip malformed lookup key: {}", e);
                        Ok(self.iterator(None, options, KkvMetricsCollector::new()))
                    }
                }
            })
            .collect()
    }
}

/// [KkvReader] backed by a shared [SearchCache].
#[derive(Debug)]
pub struct KkvCachedReader<S: SKeyType> {
    reader: KkvReader<S>,
    cache: Arc<SearchCache>,
}

impl<S: SKeyType> KkvCachedReader<S> {
    pub fn new(reader: KkvReader<S>, cache: Arc<SearchCache>) -> Self {
        Self { reader, cache }
    }

    pub fn open(
        config: Arc<KkvIndexConfig>,
        tablet: &TabletData,
        cache: Arc<SearchCache>,
    ) -> KkvResult<Self> {
        Ok(Self::new(KkvReader::open(config, tablet)?, cache))
    }

    pub fn reader(&self) -> &KkvReader<S> {
        &self.reader
    }

    pub fn cache(&self) -> &Arc<SearchCache> {
        &self.cache
    }

    pub fn lookup(
        &self,
        pkey: PKeyType,
        skeys: &[S],
        options: &LookupOptions,
    ) -> KkvResult<KkvIterator<S>> {
        self.reader.lookup_impl(pkey, skeys, options, Some(&self.cache))
    }

    pub async fn lookup_async(
        &self,
        pkey: PKeyType,
        skeys: &[S],
        options: &LookupOptions,
    ) -> KkvResult<KkvIterator<S>> {
        self.reader
            .lookup_async_impl(pkey, skeys, options, Some(&self.cache))
            .await
    }

    pub fn batch_lookup(
        &self,
        queries: &[RawQuery<'_>],
        options: &LookupOptions,
    ) -> Vec<KkvResult<KkvIterator<S>>> {
        self.reader.batch_lookup_impl(queries, options, Some(&self.cache))
    }
}
