//! # KKV index read path
//!
//! A KKV index maps a prefix key (pkey) to many values, each named by a
//! suffix key (skey). Data is hash-partitioned into a power-of-two number of
//! shards and lives in segments:
//!
//! - building segments ([KkvMemIndexer]) take live writes in memory
//! - built segments ([KkvDiskIndexer]) are immutable block files
//!
//! A lookup resolves one pkey across all segments of its shard, newest
//! first. The first record of an skey wins, a pkey tombstone hides
//! everything older, and records outside the ttl window are dropped.
//!
//! [KkvCachedReader] puts a [SearchCache] under the built segments. A cache
//! entry holds the disk-layer records of one lookup shape, tagged with the
//! locator of the newest built segment it reflects:
//!
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ KkvCacheItem                                                     │
//! │┌ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┐│
//! │  skey | ts | expire | value end  ...      value bytes            │
//! ││ S      u32   u32       u32            │ contiguous              ││
//! │ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ │
//! └──────────────────────────────────────────────────────────────────┘
//!
//! Only built segments newer than that locator are read before the entry.
//!
//! ```
//! use std::sync::Arc;
//! use kkv_store::{
//!     config::{FieldConfig, FieldType, KkvIndexConfig},
//!     segment::{IndexType, Segment, SegmentStatus, TabletData},
//!     KkvMemIndexer, KkvReader, LookupOptions,
//! };
//! use kkv_common::Locator;
//!
//! let config = KkvIndexConfig::new(
//!     "kkv",
//!     FieldConfig::new("uid", FieldType::UInt64),
//!     FieldConfig::new("item", FieldType::UInt32),
//! );
//! let indexer = Arc::new(KkvMemIndexer::<u32>::new(&config).unwrap());
//! indexer.add(1, 12, b"twelve", 3_000_000, 0).unwrap();
//! let tablet = TabletData::new(vec![Arc::new(
//!     Segment::new(0, SegmentStatus::Building, 0, Locator::invalid())
//!         .with_indexer(IndexType::Kkv, "kkv", indexer),
//! )]);
//! let reader = KkvReader::<u32>::open(Arc::new(config), &tablet).unwrap();
//! let iter = reader.lookup(1, &[], &LookupOptions::at(4_000_000)).unwrap();
//! assert_eq!(iter.get_current_skey(), Some(12));
//! ```
pub mod cache_context;
pub mod cache_item;
pub mod compress;
pub mod config;
pub mod iter;
pub mod metrics;
pub mod options;
mod plain_format;
pub mod reader;
pub mod record_iter;
pub mod search;
pub mod search_cache;
pub mod segment;
pub mod shard;
pub mod types;
mod utils;

pub use cache_item::KkvCacheItem;
pub use config::KkvIndexConfig;
pub use iter::KkvIterator;
pub use metrics::KkvMetricsCollector;
pub use options::KkvIndexOptions;
pub use plain_format::PlainFormatEncoder;
pub use reader::{KkvCachedReader, KkvReader, LookupOptions, RawQuery};
pub use record_iter::{KkvRecord, KkvShardRecordIterator, RecordCheckpoint};
pub use search::TimeoutTerminator;
pub use search_cache::{SearchCache, SearchCacheConfig};
pub use segment::{KkvDiskIndexer, KkvMemIndexer};
pub use shard::ShardPartitioner;
pub use types::{KkvDoc, SKeyType};
