//! Block metadata record.
//!
//! Written as JSON and always last: the presence of a block's meta object is
//! what makes the block visible. A crash that leaves data/index/bloom objects
//! without a meta leaves an invisible orphan, never a torn block.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::TenantId;

pub type BlockId = Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub tenant_id: TenantId,
    /// Earliest span start in the block, unix nanos.
    pub min_time_unix_nanos: i64,
    /// Latest span end in the block, unix nanos.
    pub max_time_unix_nanos: i64,
    pub trace_count: usize,
    pub span_count: usize,
    /// Total bytes across data + index + bloom segments.
    pub total_bytes: u64,
    pub bloom_shard_count: usize,
    pub bloom_fp_rate: f64,
    /// 0 for freshly flushed blocks; +1 per compaction generation.
    pub compaction_level: u32,
    pub created_at: DateTime<Utc>,
}

impl BlockMeta {
    /// Does this block's time range overlap [start, end]?
    pub fn overlaps(&self, start_unix_nanos: i64, end_unix_nanos: i64) -> bool {
        self.min_time_unix_nanos <= end_unix_nanos && self.max_time_unix_nanos >= start_unix_nanos
    }

    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
