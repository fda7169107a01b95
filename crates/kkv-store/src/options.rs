use kkv_common::INVALID_TIMESTAMP;

use crate::{
    config::{CachePriority, KkvIndexConfig, SortParam},
    plain_format::PlainFormatEncoder,
    segment::{IndexType, SegmentStatus, TabletData},
};

/// Ttl used when the index has none, keeps every record.
pub const DEFAULT_TTL: u32 = u32::MAX;

/// Lookup options derived from the index config and the tablet topology
/// when a reader is opened.
#[derive(Debug, Clone)]
pub struct KkvIndexOptions {
    pub ttl: u32,
    pub enable_ttl: bool,
    /// -1 when values have variable length.
    pub fixed_value_len: i32,
    pub encoder: Option<PlainFormatEncoder>,
    /// Set only when every skey list of the tablet is known to be sorted.
    pub sort_params: Option<Vec<SortParam>>,
    pub skey_count_limit: u32,
    pub cache_priority: CachePriority,
    pub optimize_store_skey: bool,
}

impl KkvIndexOptions {
    pub fn new(config: &KkvIndexConfig, tablet: &TabletData) -> Self {
        Self {
            ttl: config.ttl.unwrap_or(DEFAULT_TTL),
            enable_ttl: config.ttl.is_some(),
            fixed_value_len: config
                .fixed_value_len
                .and_then(|len| i32::try_from(len).ok())
                .unwrap_or(-1),
            encoder: PlainFormatEncoder::new(config.value_compression.into()),
            sort_params: Self::derive_sort_params(config, tablet),
            skey_count_limit: config.skey_count_limit.unwrap_or(u32::MAX),
            cache_priority: config.cache_priority,
            optimize_store_skey: config.optimize_store_skey,
        }
    }

    /// Skeys are only globally sorted while a single built segment holds all
    /// the data. Anything still in memory or spread over several segments
    /// is merged in layer order instead.
    fn derive_sort_params(config: &KkvIndexConfig, tablet: &TabletData) -> Option<Vec<SortParam>> {
        if !config.enable_sort_skey {
            return None;
        }
        let mut with_index = tablet
            .segments()
            .iter()
            .filter(|s| s.get_indexer(IndexType::Kkv, &config.index_name).is_some());
        match (with_index.next(), with_index.next()) {
            (None, _) => Some(config.sort_params.clone()),
            (Some(seg), None) if seg.status() == SegmentStatus::Built => {
                Some(config.sort_params.clone())
            }
            _ => None,
        }
    }

    pub fn match_sort_condition(&self) -> bool {
        self.sort_params.is_some()
    }

    /// Oldest timestamp, in seconds, a record may carry to be returned at
    /// `current_ts`.
    pub fn min_timestamp(&self, current_ts: u32) -> u32 {
        if !self.enable_ttl || current_ts == INVALID_TIMESTAMP {
            return 0;
        }
        current_ts.saturating_sub(self.ttl)
    }
}
