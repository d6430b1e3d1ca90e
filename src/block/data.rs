//! Data segment codec.
//!
//! The segment is a concatenation of per-trace records in trace-ID order.
//! Record layout: [uncompressed_len:4][compressed_len:4][crc32:4][lz4 bytes],
//! payload = bincode-serialized `Vec<Span>`. Offsets and lengths of whole
//! records are what the index points at, so a single trace can be decoded
//! from its region without touching the rest of the segment.

use crc32fast::Hasher as Crc32;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::error::{Result, TraceError};
use crate::model::Span;

const RECORD_HEADER: usize = 12;

/// Serialize one trace's spans into a record. Returns the record bytes.
pub fn encode_record(spans: &[Span]) -> Result<Vec<u8>> {
    let payload = bincode::serialize(spans)?;
    let compressed = compress_prepend_size(&payload);
    let mut crc = Crc32::new();
    crc.update(&compressed);

    let mut out = Vec::with_capacity(RECORD_HEADER + compressed.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.finalize().to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decode one record (as addressed by an index entry) back into spans.
pub fn decode_record(bytes: &[u8]) -> Result<Vec<Span>> {
    if bytes.len() < RECORD_HEADER {
        return Err(TraceError::Corrupt("record shorter than header".into()));
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[4..8]);
    let compressed_len = u32::from_le_bytes(buf) as usize;
    buf.copy_from_slice(&bytes[8..12]);
    let expected_crc = u32::from_le_bytes(buf);

    let end = RECORD_HEADER + compressed_len;
    if bytes.len() < end {
        return Err(TraceError::Corrupt("record truncated".into()));
    }
    let compressed = &bytes[RECORD_HEADER..end];

    let mut crc = Crc32::new();
    crc.update(compressed);
    if crc.finalize() != expected_crc {
        return Err(TraceError::Corrupt("record checksum mismatch".into()));
    }

    let payload = decompress_size_prepended(compressed)
        .map_err(|e| TraceError::Corrupt(format!("lz4: {}", e)))?;
    let spans: Vec<Span> = bincode::deserialize(&payload)?;
    Ok(spans)
}
