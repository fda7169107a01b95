use std::sync::Arc;

use bytes::Bytes;
use kkv_common::{KkvError, KkvResult};
use rustc_hash::FxHashSet;

use crate::{
    metrics::KkvMetricsCollector,
    options::KkvIndexOptions,
    plain_format::PlainFormatEncoder,
    segment::PKeyDocs,
    types::{KkvDoc, SKeyType},
};

pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Live records of a single segment. Used when one segment is all a shard
/// has, so there is nothing to merge.
#[derive(Debug)]
pub struct SegmentDocIter<S> {
    docs: std::vec::IntoIter<KkvDoc<S>>,
    filter: Option<FxHashSet<S>>,
    min_ts: u32,
    current_ts: u32,
    remaining: usize,
    next: Option<KkvDoc<S>>,
}

impl<S: SKeyType> SegmentDocIter<S> {
    pub fn new(docs: PKeyDocs<S>, skeys: &[S], min_ts: u32, current_ts: u32, limit: u32) -> Self {
        let mut iter = Self {
            docs: docs.docs.into_iter(),
            filter: (!skeys.is_empty()).then(|| skeys.iter().copied().collect()),
            min_ts,
            current_ts,
            remaining: limit as usize,
            next: None,
        };
        iter.advance();
        iter
    }

    fn advance(&mut self) {
        self.next = None;
        if self.remaining == 0 {
            return;
        }
        for doc in self.docs.by_ref() {
            if doc.skey_deleted || !doc.is_alive(self.min_ts, self.current_ts) {
                continue;
            }
            if let Some(filter) = &self.filter {
                if !filter.contains(&doc.skey) {
                    continue;
                }
            }
            self.remaining -= 1;
            self.next = Some(doc);
            return;
        }
    }

    fn is_valid(&self) -> bool {
        self.next.is_some()
    }

    fn batch_get(&mut self, out: &mut Vec<KkvDoc<S>>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            let Some(doc) = self.next.take() else {
                break;
            };
            out.push(doc);
            n += 1;
            self.advance();
        }
        n
    }
}

/// Output of the layer merge.
#[derive(Debug)]
pub struct MergedDocIter<S> {
    docs: std::vec::IntoIter<KkvDoc<S>>,
}

impl<S: SKeyType> MergedDocIter<S> {
    pub fn new(docs: Vec<KkvDoc<S>>) -> Self {
        Self {
            docs: docs.into_iter(),
        }
    }

    fn is_valid(&self) -> bool {
        self.docs.len() > 0
    }

    fn batch_get(&mut self, out: &mut Vec<KkvDoc<S>>, max: usize) -> usize {
        let before = out.len();
        out.extend(self.docs.by_ref().take(max));
        out.len() - before
    }
}

#[derive(Debug)]
pub enum KkvIteratorImpl<S> {
    Building(SegmentDocIter<S>),
    Built(SegmentDocIter<S>),
    Merged(MergedDocIter<S>),
}

impl<S: SKeyType> KkvIteratorImpl<S> {
    pub fn is_valid(&self) -> bool {
        match self {
            KkvIteratorImpl::Building(it) | KkvIteratorImpl::Built(it) => it.is_valid(),
            KkvIteratorImpl::Merged(it) => it.is_valid(),
        }
    }

    /// Appends at most `max` docs to `out`, returns how many were added.
    pub fn batch_get(&mut self, out: &mut Vec<KkvDoc<S>>, max: usize) -> usize {
        match self {
            KkvIteratorImpl::Building(it) | KkvIteratorImpl::Built(it) => it.batch_get(out, max),
            KkvIteratorImpl::Merged(it) => it.batch_get(out, max),
        }
    }
}

/// Result of a lookup.
///
/// ```text
/// let mut iter = reader.lookup(pkey, &[], &LookupOptions::default())?;
/// while iter.is_valid() {
///     let value = iter.get_current_value()?;
///     iter.move_to_next();
/// }
/// iter.finish();
/// ```
#[derive(Debug)]
pub struct KkvIterator<S: SKeyType> {
    inner: Option<KkvIteratorImpl<S>>,
    buffer: Vec<KkvDoc<S>>,
    cursor: usize,
    batch_size: usize,
    encoder: Option<PlainFormatEncoder>,
    skey_field_name: Arc<str>,
    optimize_store_skey: bool,
    sorted: bool,
    metrics: Arc<KkvMetricsCollector>,
}

impl<S: SKeyType> KkvIterator<S> {
    pub fn new(
        inner: Option<KkvIteratorImpl<S>>,
        options: &KkvIndexOptions,
        skey_field_name: Arc<str>,
        batch_size: usize,
        metrics: Arc<KkvMetricsCollector>,
    ) -> Self {
        let mut this = Self {
            inner,
            buffer: Vec::new(),
            cursor: 0,
            batch_size: batch_size.max(1),
            encoder: options.encoder,
            skey_field_name,
            optimize_store_skey: options.optimize_store_skey,
            sorted: options.match_sort_condition(),
            metrics,
        };
        this.fill();
        this
    }

    /// An iterator that holds nothing.
    pub fn empty(
        options: &KkvIndexOptions,
        skey_field_name: Arc<str>,
        metrics: Arc<KkvMetricsCollector>,
    ) -> Self {
        Self::new(None, options, skey_field_name, DEFAULT_BATCH_SIZE, metrics)
    }

    fn fill(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
        if let Some(inner) = &mut self.inner {
            if inner.is_valid() {
                inner.batch_get(&mut self.buffer, self.batch_size);
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cursor < self.buffer.len()
    }

    /// Does nothing once the iterator is exhausted.
    pub fn move_to_next(&mut self) {
        if !self.is_valid() {
            return;
        }
        self.cursor += 1;
        if self.cursor == self.buffer.len() && self.buffer.len() == self.batch_size {
            self.fill();
        }
    }

    pub fn current(&self) -> Option<&KkvDoc<S>> {
        self.buffer.get(self.cursor)
    }

    /// Plain value of the current record.
    pub fn get_current_value(&self) -> KkvResult<Bytes> {
        let doc = self
            .current()
            .ok_or_else(|| KkvError::NotFoundError("iterator is exhausted".into()))?;
        match &self.encoder {
            Some(encoder) if !doc.in_cache => encoder.decode(&doc.value),
            _ => Ok(doc.value.clone()),
        }
    }

    pub fn get_current_timestamp(&self) -> Option<u32> {
        self.current().map(|d| d.timestamp)
    }

    pub fn get_current_skey(&self) -> Option<S> {
        self.current().map(|d| d.skey)
    }

    pub fn get_current_expire_time(&self) -> Option<u32> {
        self.current().map(|d| d.expire_time)
    }

    pub fn is_optimize_store_skey(&self) -> bool {
        self.optimize_store_skey
    }

    pub fn get_skey_field_name(&self) -> &str {
        &self.skey_field_name
    }

    /// Whether records come out in the index's configured skey order.
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn metrics(&self) -> &Arc<KkvMetricsCollector> {
        &self.metrics
    }

    pub fn finish(&mut self) {
        self.metrics.finish();
    }

    /// Drains the remaining records as `(skey, plain value)` pairs.
    pub fn collect_values(mut self) -> KkvResult<Vec<(S, Bytes)>> {
        let mut ans = Vec::new();
        while self.is_valid() {
            if let Some(skey) = self.get_current_skey() {
                ans.push((skey, self.get_current_value()?));
            }
            self.move_to_next();
        }
        self.finish();
        Ok(ans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compress::CompressionType,
        config::{FieldConfig, FieldType, KkvIndexConfig},
        segment::TabletData,
    };

    fn options() -> KkvIndexOptions {
        let config = KkvIndexConfig::new(
            "kkv",
            FieldConfig::new("pk", FieldType::UInt64),
            FieldConfig::new("sk", FieldType::UInt32),
        );
        KkvIndexOptions::new(&config, &TabletData::default())
    }

    fn docs(n: u32) -> Vec<KkvDoc<u32>> {
        (0..n)
            .map(|i| KkvDoc::new(i, i, Bytes::from(i.to_string())))
            .collect()
    }

    #[test]
    fn refills_in_batches() {
        let inner = KkvIteratorImpl::Merged(MergedDocIter::new(docs(7)));
        let mut iter =
            KkvIterator::new(Some(inner), &options(), "sk".into(), 3, KkvMetricsCollector::new());
        let mut seen = Vec::new();
        while iter.is_valid() {
            seen.push(iter.get_current_skey().unwrap());
            iter.move_to_next();
        }
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        iter.move_to_next();
        assert!(!iter.is_valid());
        assert!(iter.get_current_value().is_err());
    }

    #[test]
    fn empty_iterator() {
        let mut iter =
            KkvIterator::<u32>::empty(&options(), "sk".into(), KkvMetricsCollector::new());
        assert!(!iter.is_valid());
        iter.move_to_next();
        iter.move_to_next();
        assert!(!iter.is_valid());
        assert_eq!(iter.get_skey_field_name(), "sk");
        iter.finish();
        iter.finish();
        assert!(iter.metrics().is_finished());
    }

    #[test]
    fn segment_iter_filters() {
        let mut all = docs(6);
        all[1].skey_deleted = true;
        all[2].expire_time = 3;
        let pkey_docs = PKeyDocs {
            deleted_ts: None,
            docs: all,
        };
        let inner =
            KkvIteratorImpl::Built(SegmentDocIter::new(pkey_docs, &[1, 2, 3, 4, 5], 0, 3, 2));
        let values =
            KkvIterator::new(Some(inner), &options(), "sk".into(), 8, KkvMetricsCollector::new())
                .collect_values()
                .unwrap();
        let skeys: Vec<_> = values.iter().map(|(s, _)| *s).collect();
        assert_eq!(skeys, vec![3, 4]);
    }

    #[test]
    fn cached_values_are_not_decoded_twice() {
        let mut options = options();
        let encoder = PlainFormatEncoder::new(CompressionType::LZ4).unwrap();
        options.encoder = Some(encoder);
        let wire = KkvDoc::new(1u32, 0, encoder.encode(b"plain plain plain"));
        let mut cached = KkvDoc::new(2u32, 0, Bytes::from_static(b"already plain"));
        cached.in_cache = true;
        let inner = KkvIteratorImpl::Merged(MergedDocIter::new(vec![wire, cached]));
        let values =
            KkvIterator::new(Some(inner), &options, "sk".into(), 8, KkvMetricsCollector::new())
                .collect_values()
                .unwrap();
        assert_eq!(&values[0].1[..], b"plain plain plain");
        assert_eq!(&values[1].1[..], b"already plain");
    }
}
