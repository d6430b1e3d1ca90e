//! Sharded bloom filters over trace IDs.
//!
//! Each block carries a small set of independent filters; a trace ID maps to
//! exactly one shard by hash, so a lookup loads and checks a single filter.
//! No false negatives; false positives bounded by the configured target rate.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Result, TraceError};
use crate::model::TraceId;

const LN2: f64 = std::f64::consts::LN_2;

/// A single bloom filter shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    size: usize,
    hash_count: usize,
}

impl BloomFilter {
    /// Size the filter for `expected_items` at the given false-positive rate
    /// using m = -n * ln(p) / ln(2)^2 and k = m/n * ln(2).
    pub fn with_target_rate(expected_items: usize, fp_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let size_bits = (-(n * fp_rate.ln()) / (LN2 * LN2)).ceil() as usize;
        let hash_count = ((size_bits as f64 / n) * LN2).round().max(1.0) as usize;
        let word_count = (size_bits.max(64) + 63) / 64;
        Self {
            bits: vec![0; word_count],
            size: word_count * 64,
            hash_count,
        }
    }

    pub fn insert(&mut self, id: &TraceId) {
        let hash = xxh3_64(id.as_bytes());
        for i in 0..self.hash_count {
            let pos = self.bit_pos(hash, i);
            self.bits[pos / 64] |= 1u64 << (pos % 64);
        }
    }

    /// False means definitely absent; true means possibly present.
    pub fn maybe_contains(&self, id: &TraceId) -> bool {
        let hash = xxh3_64(id.as_bytes());
        for i in 0..self.hash_count {
            let pos = self.bit_pos(hash, i);
            if self.bits[pos / 64] & (1u64 << (pos % 64)) == 0 {
                return false;
            }
        }
        true
    }

    // Double hashing: h_i(x) = h1 + i * h2 mod m, h2 forced odd.
    #[inline]
    fn bit_pos(&self, hash: u64, i: usize) -> usize {
        let h1 = hash as usize;
        let h2 = (hash >> 32) as usize | 1;
        h1.wrapping_add(i.wrapping_mul(h2)) % self.size
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let filter: BloomFilter = bincode::deserialize(bytes)
            .map_err(|e| TraceError::Corrupt(format!("bloom filter: {}", e)))?;
        if filter.bits.len() * 64 != filter.size || filter.hash_count == 0 {
            return Err(TraceError::Corrupt("bloom filter geometry mismatch".into()));
        }
        Ok(filter)
    }
}

/// Routes a trace ID to its bloom shard. Hash-modulo keeps shard fill uniform
/// so every shard holds its target false-positive rate.
pub fn shard_for(id: &TraceId, shard_count: usize) -> usize {
    (xxh3_64(id.as_bytes()) % shard_count.max(1) as u64) as usize
}

/// Build the sharded filter set for a sorted list of trace IDs.
pub fn build_shards(ids: &[TraceId], shard_count: usize, fp_rate: f64) -> Vec<BloomFilter> {
    let shard_count = shard_count.max(1);
    let mut counts = vec![0usize; shard_count];
    for id in ids {
        counts[shard_for(id, shard_count)] += 1;
    }
    let mut shards: Vec<BloomFilter> = counts
        .iter()
        .map(|&n| BloomFilter::with_target_rate(n, fp_rate))
        .collect();
    for id in ids {
        shards[shard_for(id, shard_count)].insert(id);
    }
    shards
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let ids: Vec<TraceId> = (0..5000).map(TraceId::from_u64).collect();
        let shards = build_shards(&ids, 4, 0.01);
        for id in &ids {
            assert!(shards[shard_for(id, 4)].maybe_contains(id));
        }
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let ids: Vec<TraceId> = (0..10_000).map(TraceId::from_u64).collect();
        let shards = build_shards(&ids, 4, 0.01);

        let mut false_positives = 0;
        for i in 10_000u64..30_000 {
            let id = TraceId::from_u64(i);
            if shards[shard_for(&id, 4)].maybe_contains(&id) {
                false_positives += 1;
            }
        }
        // Target 1% over 20k probes; allow generous variance.
        assert!(false_positives < 600, "fp count {}", false_positives);
    }

    #[test]
    fn encode_decode() {
        let ids: Vec<TraceId> = (0..100).map(TraceId::from_u64).collect();
        let mut filter = BloomFilter::with_target_rate(ids.len(), 0.01);
        for id in &ids {
            filter.insert(id);
        }
        let decoded = BloomFilter::decode(&filter.encode().unwrap()).unwrap();
        for id in &ids {
            assert!(decoded.maybe_contains(id));
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(BloomFilter::decode(b"not a filter").is_err());
    }

    #[test]
    fn empty_shard_reports_absent() {
        let filter = BloomFilter::with_target_rate(0, 0.01);
        assert!(!filter.maybe_contains(&TraceId::from_u64(42)));
    }
}
