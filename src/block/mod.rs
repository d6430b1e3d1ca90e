//! Block codec: the on-object-storage encoding of a completed batch of traces.
//!
//! A block is four kinds of segment: a data segment of per-trace records in
//! trace-ID order, a sorted fixed-width index for binary search, a set of
//! sharded bloom filters, and a JSON metadata record. Encoding and decoding
//! here are pure; persistence lives in `backend::io`.

pub mod bloom;
pub mod data;
pub mod index;
pub mod meta;

use std::collections::BTreeMap;

use chrono::Utc;
use uuid::Uuid;

pub use bloom::BloomFilter;
pub use index::{BlockIndex, IndexEntry};
pub use meta::{BlockId, BlockMeta};

use crate::config::BlockConfig;
use crate::error::{Result, TraceError};
use crate::model::{Span, TenantId, TraceId};

/// A fully encoded block, ready to be persisted.
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    pub meta: BlockMeta,
    pub data: Vec<u8>,
    pub index: BlockIndex,
    pub blooms: Vec<BloomFilter>,
}

/// Encode spans grouped by trace into a block. The BTreeMap input fixes the
/// trace-ID order the data segment and index both rely on.
pub fn encode(
    tenant_id: &TenantId,
    traces: &BTreeMap<TraceId, Vec<Span>>,
    config: &BlockConfig,
) -> Result<EncodedBlock> {
    encode_at_level(tenant_id, traces, config, 0)
}

pub fn encode_at_level(
    tenant_id: &TenantId,
    traces: &BTreeMap<TraceId, Vec<Span>>,
    config: &BlockConfig,
    compaction_level: u32,
) -> Result<EncodedBlock> {
    if traces.is_empty() {
        return Err(TraceError::Codec("cannot encode an empty block".into()));
    }

    let mut data = Vec::new();
    let mut entries = Vec::with_capacity(traces.len());
    let mut span_count = 0usize;
    let mut min_time = i64::MAX;
    let mut max_time = i64::MIN;

    for (trace_id, spans) in traces {
        if spans.is_empty() {
            continue;
        }
        let record = data::encode_record(spans)?;
        entries.push(IndexEntry {
            trace_id: *trace_id,
            offset: data.len() as u64,
            len: record.len() as u32,
        });
        data.extend_from_slice(&record);

        span_count += spans.len();
        for span in spans {
            min_time = min_time.min(span.start_unix_nanos);
            max_time = max_time.max(span.end_unix_nanos());
        }
    }

    if entries.is_empty() {
        return Err(TraceError::Codec("cannot encode an empty block".into()));
    }

    let ids: Vec<TraceId> = entries.iter().map(|e| e.trace_id).collect();
    let blooms = bloom::build_shards(&ids, config.bloom_shard_count, config.bloom_fp_rate);
    let index = BlockIndex::from_sorted(entries)?;

    let bloom_bytes: usize = blooms.iter().map(|b| b.encode().map(|v| v.len()).unwrap_or(0)).sum();
    let total_bytes = (data.len() + index.encode().len() + bloom_bytes) as u64;

    let meta = BlockMeta {
        block_id: Uuid::new_v4(),
        tenant_id: tenant_id.clone(),
        min_time_unix_nanos: min_time,
        max_time_unix_nanos: max_time,
        trace_count: index.len(),
        span_count,
        total_bytes,
        bloom_shard_count: config.bloom_shard_count.max(1),
        bloom_fp_rate: config.bloom_fp_rate,
        compaction_level,
        created_at: Utc::now(),
    };

    Ok(EncodedBlock {
        meta,
        data,
        index,
        blooms,
    })
}

/// Seekable view over a decoded block's segments.
#[derive(Debug, Clone)]
pub struct BlockReader {
    pub meta: BlockMeta,
    data: Vec<u8>,
    index: BlockIndex,
    blooms: Vec<BloomFilter>,
}

impl BlockReader {
    pub fn new(
        meta: BlockMeta,
        data: Vec<u8>,
        index: BlockIndex,
        blooms: Vec<BloomFilter>,
    ) -> Self {
        Self {
            meta,
            data,
            index,
            blooms,
        }
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    /// Bloom check only; never a false negative.
    pub fn maybe_contains(&self, trace_id: &TraceId) -> bool {
        if self.blooms.is_empty() {
            return true;
        }
        let shard = bloom::shard_for(trace_id, self.blooms.len());
        self.blooms[shard].maybe_contains(trace_id)
    }

    /// Bloom check, then binary search, then region decode.
    pub fn find_trace(&self, trace_id: &TraceId) -> Result<Option<Vec<Span>>> {
        if !self.maybe_contains(trace_id) {
            return Ok(None);
        }
        let entry = match self.index.find(trace_id) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        Ok(Some(self.decode_entry(&entry)?))
    }

    fn decode_entry(&self, entry: &IndexEntry) -> Result<Vec<Span>> {
        let start = entry.offset as usize;
        let end = start + entry.len as usize;
        if end > self.data.len() {
            return Err(TraceError::Corrupt(format!(
                "index entry past end of data segment ({} > {})",
                end,
                self.data.len()
            )));
        }
        data::decode_record(&self.data[start..end])
    }

    /// Full scan in trace-ID order; compaction and search both walk this.
    pub fn iter_traces(&self) -> impl Iterator<Item = Result<(TraceId, Vec<Span>)>> + '_ {
        self.index
            .entries()
            .iter()
            .map(move |entry| self.decode_entry(entry).map(|spans| (entry.trace_id, spans)))
    }
}
