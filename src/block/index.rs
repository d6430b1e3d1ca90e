//! Block index: sorted (trace ID, offset, length) entries over the data
//! segment, fixed-width so the whole index can be binary searched after a
//! single read.

use crate::error::{Result, TraceError};
use crate::model::TraceId;

/// trace_id(16) + offset(8) + len(4)
const ENTRY_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub trace_id: TraceId,
    pub offset: u64,
    pub len: u32,
}

/// Sorted index over one block's data segment.
#[derive(Debug, Clone, Default)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
}

impl BlockIndex {
    /// Entries must arrive in strictly increasing trace-ID order; the data
    /// segment writer guarantees this.
    pub fn from_sorted(entries: Vec<IndexEntry>) -> Result<Self> {
        for pair in entries.windows(2) {
            if pair[0].trace_id >= pair[1].trace_id {
                return Err(TraceError::Corrupt(
                    "index entries not strictly increasing".into(),
                ));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary search for a trace ID; O(log n).
    pub fn find(&self, trace_id: &TraceId) -> Option<IndexEntry> {
        self.entries
            .binary_search_by(|e| e.trace_id.cmp(trace_id))
            .ok()
            .map(|i| self.entries[i])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * ENTRY_SIZE);
        for entry in &self.entries {
            out.extend_from_slice(entry.trace_id.as_bytes());
            out.extend_from_slice(&entry.offset.to_le_bytes());
            out.extend_from_slice(&entry.len.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % ENTRY_SIZE != 0 {
            return Err(TraceError::Corrupt(format!(
                "index length {} not a multiple of entry size",
                bytes.len()
            )));
        }
        let mut entries = Vec::with_capacity(bytes.len() / ENTRY_SIZE);
        for chunk in bytes.chunks_exact(ENTRY_SIZE) {
            let mut id = [0u8; 16];
            id.copy_from_slice(&chunk[..16]);
            let mut off = [0u8; 8];
            off.copy_from_slice(&chunk[16..24]);
            let mut len = [0u8; 4];
            len.copy_from_slice(&chunk[24..28]);
            entries.push(IndexEntry {
                trace_id: TraceId::from_bytes(id),
                offset: u64::from_le_bytes(off),
                len: u32::from_le_bytes(len),
            });
        }
        Self::from_sorted(entries)
    }
}
