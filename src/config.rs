//! Engine configuration.
//!
//! Every component takes a small config struct with sensible defaults; the
//! aggregate `Config` is what the server binary loads and hands out.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many replica acknowledgments a write needs before it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumPolicy {
    /// Every replica in the set must ack.
    All,
    /// floor(n/2) + 1 replicas must ack.
    Majority,
}

impl QuorumPolicy {
    pub fn required(&self, replicas: usize) -> usize {
        match self {
            QuorumPolicy::All => replicas,
            QuorumPolicy::Majority => replicas / 2 + 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    /// Number of ingester replicas each trace is written to.
    pub replication_factor: usize,
    pub quorum: QuorumPolicy,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            quorum: QuorumPolicy::Majority,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngesterConfig {
    /// Cut the active buffer once it holds this many bytes of span data.
    pub max_buffer_bytes: usize,
    /// Cut the active buffer once it is this old, even if small.
    pub max_buffer_age: Duration,
    /// Initial flush retry delay; doubles per attempt.
    pub flush_backoff_min: Duration,
    pub flush_backoff_max: Duration,
    /// How often the background loop checks for age-based cuts and pending flushes.
    pub flush_check_interval: Duration,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 64 * 1024 * 1024,
            max_buffer_age: Duration::from_secs(30),
            flush_backoff_min: Duration::from_millis(100),
            flush_backoff_max: Duration::from_secs(10),
            flush_check_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    /// Target bloom filter false-positive rate.
    pub bloom_fp_rate: f64,
    /// Number of bloom filter shards per block.
    pub bloom_shard_count: usize,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            bloom_fp_rate: 0.01,
            bloom_shard_count: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactorConfig {
    /// Interval between compaction passes.
    pub interval: Duration,
    /// Stop packing inputs once the estimated output reaches this size.
    pub target_block_bytes: u64,
    /// Maximum number of input blocks merged per job.
    pub max_inputs: usize,
    /// Lease duration on a claimed input set; expired claims may be retaken.
    pub claim_ttl: Duration,
    /// Delete blocks older than this. Zero disables retention.
    pub retention: Duration,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            target_block_bytes: 256 * 1024 * 1024,
            max_inputs: 8,
            claim_ttl: Duration::from_secs(300),
            retention: Duration::from_secs(14 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Width of each time shard a search query is split into.
    pub shard_window: Duration,
    /// Global cap on in-flight shards per query.
    pub max_concurrent_shards: usize,
    /// Query deadline; on expiry the frontend returns a truncated result.
    pub deadline: Duration,
    /// Default maximum number of trace summaries returned by a search.
    pub limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            shard_window: Duration::from_secs(60 * 60),
            max_concurrent_shards: 4,
            deadline: Duration::from_secs(30),
            limit: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub distributor: DistributorConfig,
    pub ingester: IngesterConfig,
    pub block: BlockConfig,
    pub compactor: CompactorConfig,
    pub query: QueryConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_counts() {
        assert_eq!(QuorumPolicy::All.required(3), 3);
        assert_eq!(QuorumPolicy::Majority.required(3), 2);
        assert_eq!(QuorumPolicy::Majority.required(4), 3);
        assert_eq!(QuorumPolicy::Majority.required(1), 1);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.distributor.replication_factor, 3);
        assert_eq!(back.query.limit, 20);
    }
}
