use bytes::Bytes;
use kkv_common::{KkvError, KkvResult, PKeyType};
use serde::{Deserialize, Serialize};

use crate::{
    metrics::KkvMetricsCollector,
    plain_format::PlainFormatEncoder,
    search::KkvSearch,
    segment::SegmentReader,
    types::{KkvDoc, SKeyType},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KkvRecord<S> {
    pub pkey: PKeyType,
    pub skey: S,
    /// Plain form.
    pub value: Bytes,
    pub timestamp: u32,
    pub expire_time: u32,
}

/// Position of the next record an iterator will emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordCheckpoint {
    pub pkey_idx: usize,
    pub skey_idx: usize,
}

/// Walks every pkey of one shard in ascending order and emits its live
/// records, resolved across all segments the same way a lookup would.
#[derive(Debug)]
pub struct KkvShardRecordIterator<S: SKeyType> {
    mem_readers: Vec<SegmentReader<S>>,
    disk_readers: Vec<SegmentReader<S>>,
    encoder: Option<PlainFormatEncoder>,
    min_ts: u32,
    current_ts: u32,
    pkeys: Vec<PKeyType>,
    pkey_idx: usize,
    skey_idx: usize,
    docs: Vec<KkvDoc<S>>,
    metrics: KkvMetricsCollector,
}

impl<S: SKeyType> KkvShardRecordIterator<S> {
    pub fn new(
        mem_readers: Vec<SegmentReader<S>>,
        disk_readers: Vec<SegmentReader<S>>,
        encoder: Option<PlainFormatEncoder>,
        min_ts: u32,
        current_ts: u32,
    ) -> KkvResult<Self> {
        let mut pkeys = Vec::new();
        for reader in mem_readers.iter().chain(disk_readers.iter()) {
            pkeys.extend(reader.pkeys()?);
        }
        pkeys.sort_unstable();
        pkeys.dedup();
        let mut this = Self {
            mem_readers,
            disk_readers,
            encoder,
            min_ts,
            current_ts,
            pkeys,
            pkey_idx: 0,
            skey_idx: 0,
            docs: Vec::new(),
            metrics: KkvMetricsCollector::default(),
        };
        this.load()?;
        Ok(this)
    }

    pub fn pkey_count(&self) -> usize {
        self.pkeys.len()
    }

    fn load(&mut self) -> KkvResult<()> {
        self.docs.clear();
        let Some(&pkey) = self.pkeys.get(self.pkey_idx) else {
            return Ok(());
        };
        self.docs = KkvSearch::new(pkey, &self.mem_readers, &self.disk_readers, &self.metrics)
            .with_time(self.min_ts, self.current_ts)
            .run()?
            .docs;
        Ok(())
    }

    pub fn checkpoint(&self) -> RecordCheckpoint {
        RecordCheckpoint {
            pkey_idx: self.pkey_idx,
            skey_idx: self.skey_idx,
        }
    }

    /// Resumes from a checkpoint taken on an iterator over the same segments.
    pub fn seek(&mut self, checkpoint: &RecordCheckpoint) -> KkvResult<()> {
        if checkpoint.pkey_idx > self.pkeys.len() {
            return Err(KkvError::InvalidArgs(
                format!(
                    "checkpoint pkey index {} out of {} pkeys",
                    checkpoint.pkey_idx,
                    self.pkeys.len()
                )
                .into(),
            ));
        }
        self.pkey_idx = checkpoint.pkey_idx;
        self.load()?;
        if checkpoint.skey_idx > self.docs.len() {
            return Err(KkvError::InvalidArgs(
                format!(
                    "checkpoint skey index {} out of {} records",
                    checkpoint.skey_idx,
                    self.docs.len()
                )
                .into(),
            ));
        }
        self.skey_idx = checkpoint.skey_idx;
        Ok(())
    }

    fn to_record(&self, pkey: PKeyType, doc: &KkvDoc<S>) -> KkvResult<KkvRecord<S>> {
        let value = match &self.encoder {
            Some(encoder) => encoder.decode(&doc.value)?,
            None => doc.value.clone(),
        };
        Ok(KkvRecord {
            pkey,
            skey: doc.skey,
            value,
            timestamp: doc.timestamp,
            expire_time: doc.expire_time,
        })
    }
}

impl<S: SKeyType> Iterator for KkvShardRecordIterator<S> {
    type Item = KkvResult<KkvRecord<S>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let &pkey = self.pkeys.get(self.pkey_idx)?;
            if let Some(doc) = self.docs.get(self.skey_idx) {
                let record = self.to_record(pkey, doc);
                self.skey_idx += 1;
                return Some(record);
            }
            self.pkey_idx += 1;
            self.skey_idx = 0;
            if let Err(e) = self.load() {
                self.pkey_idx = self.pkeys.len();
                return Some(Err(e));
            }
        }
    }
}
