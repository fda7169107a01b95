//! Merge of one pkey's records across layers.
//!
//! Layers are searched newest first:
//!
//! 1. building segments, newest to oldest
//! 2. built segments, newest to oldest, stopping at the first one the
//!    cache item already reflects
//! 3. the cache item
//!
//! The first record of a skey wins. A pkey tombstone ends the search after
//! the segment that carries it. When the built segments were fully
//! resolved the cache item is rebuilt from them, or only its locator is
//! moved forward when they held nothing new.
use std::time::{Duration, Instant};

use kkv_common::{KkvResult, PKeyType};
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::{
    cache_context::SearchCacheContext,
    cache_item::KkvCacheItem,
    metrics::KkvMetricsCollector,
    plain_format::PlainFormatEncoder,
    segment::{PKeyDocs, SegmentReader},
    types::{KkvDoc, SKeyType},
};

/// Wall clock bound of a lookup. Checked before every segment fetch.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutTerminator {
    deadline: Instant,
}

impl TimeoutTerminator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self { deadline }
    }

    pub fn is_terminated(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exhausted,
    PKeyDeleted,
    LimitReached,
    AllSKeysFound,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Building(usize),
    Built(usize),
    Cache,
}

#[derive(Debug)]
pub struct SearchOutput<S> {
    pub docs: Vec<KkvDoc<S>>,
    pub stop: StopReason,
}

pub struct KkvSearch<'a, S: SKeyType> {
    pkey: PKeyType,
    /// Oldest first.
    mem_readers: &'a [SegmentReader<S>],
    /// Newest first.
    disk_readers: &'a [SegmentReader<S>],
    filter: Option<FxHashSet<S>>,
    min_ts: u32,
    current_ts: u32,
    limit: usize,
    timeout: Option<&'a TimeoutTerminator>,
    cache: Option<&'a SearchCacheContext<S>>,
    encoder: Option<&'a PlainFormatEncoder>,
    metrics: &'a KkvMetricsCollector,
}

impl<'a, S: SKeyType> KkvSearch<'a, S> {
    pub fn new(
        pkey: PKeyType,
        mem_readers: &'a [SegmentReader<S>],
        disk_readers: &'a [SegmentReader<S>],
        metrics: &'a KkvMetricsCollector,
    ) -> Self {
        Self {
            pkey,
            mem_readers,
            disk_readers,
            filter: None,
            min_ts: 0,
            current_ts: 0,
            limit: usize::MAX,
            timeout: None,
            cache: None,
            encoder: None,
            metrics,
        }
    }

    /// An empty list means no filter.
    pub fn with_skeys(mut self, skeys: &[S]) -> Self {
        self.filter = if skeys.is_empty() {
            None
        } else {
            Some(skeys.iter().copied().collect())
        };
        self
    }

    pub fn with_time(mut self, min_ts: u32, current_ts: u32) -> Self {
        self.min_ts = min_ts;
        self.current_ts = current_ts;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit as usize;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<&'a TimeoutTerminator>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache(mut self, cache: Option<&'a SearchCacheContext<S>>) -> Self {
        self.cache = cache;
        self
    }

    /// Needed to store disk values into the cache in plain form.
    pub fn with_encoder(mut self, encoder: Option<&'a PlainFormatEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn run(self) -> KkvResult<SearchOutput<S>> {
        let mut state = SearchState::new(&self);
        for step in self.plan() {
            if self.is_timed_out() {
                state.stop = StopReason::Timeout;
                break;
            }
            let go_on = match step {
                Step::Building(i) => {
                    let fetched = self.mem_readers[i].fetch(self.pkey)?;
                    self.on_segment(&mut state, step, fetched)
                }
                Step::Built(i) => {
                    let fetched = self.disk_readers[i].fetch(self.pkey)?;
                    self.on_segment(&mut state, step, fetched)
                }
                Step::Cache => self.on_cache(&mut state),
            };
            if !go_on {
                break;
            }
        }
        Ok(self.finish(state))
    }

    /// Same merge as [Self::run], yielding at every segment fetch.
    pub async fn run_async(self) -> KkvResult<SearchOutput<S>> {
        let mut state = SearchState::new(&self);
        for step in self.plan() {
            if self.is_timed_out() {
                state.stop = StopReason::Timeout;
                break;
            }
            let go_on = match step {
                Step::Building(i) => {
                    let fetched = self.mem_readers[i].fetch_async(self.pkey).await?;
                    self.on_segment(&mut state, step, fetched)
                }
                Step::Built(i) => {
                    let fetched = self.disk_readers[i].fetch_async(self.pkey).await?;
                    self.on_segment(&mut state, step, fetched)
                }
                Step::Cache => self.on_cache(&mut state),
            };
            if !go_on {
                break;
            }
        }
        Ok(self.finish(state))
    }

    fn cache_item(&self) -> Option<&'a KkvCacheItem<S>> {
        self.cache.and_then(|c| c.get_cache_item())
    }

    fn only_cache(&self) -> bool {
        self.cache.is_some_and(|c| c.only_cache())
    }

    fn is_timed_out(&self) -> bool {
        match self.timeout {
            Some(t) if t.is_terminated() => {
                self.metrics.mark_timed_out();
                true
            }
            _ => false,
        }
    }

    fn plan(&self) -> Vec<Step> {
        let mut steps: Vec<Step> = (0..self.mem_readers.len()).rev().map(Step::Building).collect();
        let item = self.cache_item();
        if !self.only_cache() {
            let boundary = item.map(|i| i.locator());
            steps.extend(
                self.disk_readers
                    .iter()
                    .take_while(|r| boundary.map_or(true, |b| r.locator().is_newer_than(&b)))
                    .enumerate()
                    .map(|(i, _)| Step::Built(i)),
            );
        }
        if item.is_some() {
            steps.push(Step::Cache);
        }
        trace!(pkey = self.pkey, ?steps, "search plan");
        steps
    }

    /// Returns whether the search goes on.
    fn on_segment(
        &self,
        state: &mut SearchState<S>,
        step: Step,
        fetched: Option<PKeyDocs<S>>,
    ) -> bool {
        self.metrics.inc_segments_searched(1);
        let from_disk = matches!(step, Step::Built(_));
        let Some(fetched) = fetched else {
            if from_disk {
                state.disk_walked += 1;
            }
            return true;
        };
        if from_disk {
            self.metrics.inc_built_docs_read(fetched.docs.len() as u64);
        } else {
            self.metrics.inc_building_docs_read(fetched.docs.len() as u64);
        }
        for doc in fetched.docs {
            if let Some(stop) = self.on_doc(state, doc, from_disk) {
                state.stop = stop;
                return false;
            }
        }
        // Only a segment whose records were all resolved counts as walked.
        if from_disk {
            state.disk_walked += 1;
        }
        if let Some(ts) = fetched.deleted_ts {
            trace!(pkey = self.pkey, ts, ?step, "pkey tombstone");
            if from_disk {
                state.disk_deleted_ts = Some(ts);
            }
            state.stop = StopReason::PKeyDeleted;
            return false;
        }
        true
    }

    fn on_doc(
        &self,
        state: &mut SearchState<S>,
        mut doc: KkvDoc<S>,
        from_disk: bool,
    ) -> Option<StopReason> {
        if let Some(filter) = &self.filter {
            if !filter.contains(&doc.skey) {
                return None;
            }
        }
        if from_disk && self.cache.is_some() {
            state.new_disk_data = true;
            if !state.disk_seen.insert(doc.skey) {
                return None;
            }
            state.disk_cache_docs.push(doc.clone());
        }
        doc.duplicated_key = state.seen.contains(&doc.skey);
        self.emit(state, doc)
    }

    /// A duplicated key was already resolved by a newer layer. It neither
    /// counts toward the limit nor shows up in the result.
    fn emit(&self, state: &mut SearchState<S>, doc: KkvDoc<S>) -> Option<StopReason> {
        if doc.duplicated_key {
            return None;
        }
        state.seen.insert(doc.skey);
        if let Some(pending) = &mut state.pending {
            pending.remove(&doc.skey);
        }
        if !doc.skey_deleted && doc.is_alive(self.min_ts, self.current_ts) {
            state.docs.push(doc);
            if state.docs.len() >= self.limit {
                return Some(StopReason::LimitReached);
            }
        }
        match &state.pending {
            Some(pending) if pending.is_empty() => Some(StopReason::AllSKeysFound),
            _ => None,
        }
    }

    fn on_cache(&self, state: &mut SearchState<S>) -> bool {
        let Some(item) = self.cache_item() else {
            return true;
        };
        self.metrics.inc_cache_docs_read(item.count() as u64);
        for mut doc in item.docs() {
            if let Some(filter) = &self.filter {
                if !filter.contains(&doc.skey) {
                    continue;
                }
            }
            if state.disk_seen.contains(&doc.skey) {
                continue;
            }
            state.carried.push(doc.clone());
            doc.duplicated_key = state.seen.contains(&doc.skey);
            if let Some(stop) = self.emit(state, doc) {
                state.stop = stop;
                return false;
            }
        }
        state.cache_consumed = true;
        false
    }

    /// Whether every built segment up to the cache boundary was resolved,
    /// so that the disk view can be cached as a whole.
    fn disk_view_complete(&self, state: &SearchState<S>) -> bool {
        if state.disk_deleted_ts.is_some() || state.cache_consumed {
            return true;
        }
        if let Some(filter) = &self.filter {
            if filter.iter().all(|s| state.disk_seen.contains(s)) {
                return true;
            }
        }
        self.cache_item().is_none() && state.disk_walked == self.disk_readers.len()
    }

    fn finish(&self, mut state: SearchState<S>) -> SearchOutput<S> {
        self.refresh_cache(&mut state);
        self.metrics.inc_result_count(state.docs.len() as u64);
        debug!(
            pkey = self.pkey,
            count = state.docs.len(),
            stop = ?state.stop,
            "search done"
        );
        SearchOutput {
            docs: state.docs,
            stop: state.stop,
        }
    }

    fn refresh_cache(&self, state: &mut SearchState<S>) {
        let Some(ctx) = self.cache else {
            return;
        };
        let Some(newest) = self.disk_readers.first() else {
            return;
        };
        if ctx.only_cache() || !self.disk_view_complete(state) {
            return;
        }
        let newest_locator = newest.locator();
        let old = ctx.get_cache_item();
        if let Some(old) = old {
            if !state.new_disk_data && state.cache_consumed {
                if newest_locator.is_newer_than(&old.locator()) {
                    trace!(pkey = self.pkey, locator = %newest_locator, "refresh cache locator");
                    old.refresh_locator(newest_locator);
                }
                return;
            }
        }

        let mut docs = std::mem::take(&mut state.disk_cache_docs);
        if let Some(encoder) = self.encoder {
            for doc in docs.iter_mut().filter(|d| !d.skey_deleted) {
                match encoder.decode(&doc.value) {
                    Ok(plain) => doc.value = plain,
                    Err(e) => {
                        warn!(pkey = self.pkey, "skip caching undecodable value: {}", e);
                        return;
                    }
                }
            }
        }
        let timestamp = match state.disk_deleted_ts {
            Some(ts) => ts,
            None => old.map_or(0, |o| o.timestamp()),
        };
        let item = KkvCacheItem::create(docs.iter().chain(state.carried.iter()))
            .with_locator(newest_locator)
            .with_timestamp(timestamp)
            .with_next_rt_segment_id(newest.segment_id() + 1);
        trace!(pkey = self.pkey, count = item.count(), locator = %newest_locator, "put cache item");
        ctx.put_cache_item(item);
    }
}

struct SearchState<S> {
    seen: FxHashSet<S>,
    disk_seen: FxHashSet<S>,
    pending: Option<FxHashSet<S>>,
    docs: Vec<KkvDoc<S>>,
    disk_cache_docs: Vec<KkvDoc<S>>,
    carried: Vec<KkvDoc<S>>,
    new_disk_data: bool,
    disk_deleted_ts: Option<u32>,
    disk_walked: usize,
    cache_consumed: bool,
    stop: StopReason,
}

impl<S: SKeyType> SearchState<S> {
    fn new(search: &KkvSearch<'_, S>) -> Self {
        Self {
            seen: FxHashSet::default(),
            disk_seen: FxHashSet::default(),
            pending: search.filter.clone(),
            docs: Vec::new(),
            disk_cache_docs: Vec::new(),
            carried: Vec::new(),
            new_disk_data: false,
            disk_deleted_ts: None,
            disk_walked: 0,
            cache_consumed: false,
            stop: StopReason::Exhausted,
        }
    }
}
