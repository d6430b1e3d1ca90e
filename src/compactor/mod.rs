//! Compactor: merges small blocks into larger ones and applies retention.
//!
//! Selection packs the oldest blocks of a tenant up to a target output size.
//! An input set is claimed in a lease table before merging so two jobs never
//! produce the same output; the merge writes the new block fully (meta last)
//! before deleting its inputs, so a crash at any point leaves the old blocks
//! valid and a rerun merely wasteful.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::BlockStore;
use crate::block::{self, BlockMeta};
use crate::config::{BlockConfig, CompactorConfig};
use crate::error::{Result, TraceError};
use crate::model::{Span, TenantId, TraceId};

pub struct Compactor {
    config: CompactorConfig,
    block_config: BlockConfig,
    store: BlockStore,
    /// Lease table keyed by the sorted input-set fingerprint.
    claims: DashMap<String, Instant>,
}

impl Compactor {
    pub fn new(config: CompactorConfig, block_config: BlockConfig, store: BlockStore) -> Self {
        Self {
            config,
            block_config,
            store,
            claims: DashMap::new(),
        }
    }

    /// One pass over every tenant: retention sweep, then compaction jobs.
    pub async fn run_once(&self) -> Result<()> {
        for tenant in self.store.tenants().await? {
            if let Err(e) = self.compact_tenant(&tenant).await {
                warn!(tenant = %tenant, error = %e, "compaction pass failed");
            }
        }
        Ok(())
    }

    pub async fn compact_tenant(&self, tenant: &TenantId) -> Result<()> {
        let mut metas = self.store.list_blocks(tenant).await?;
        metas = self.sweep_retention(metas).await?;

        for inputs in select_inputs(&metas, &self.config) {
            match self.compact_set(tenant, &inputs).await {
                Ok(()) => {}
                // Another job holds this input set; abandon silently.
                Err(TraceError::CompactionConflict) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete blocks past the retention cutoff; returns the survivors.
    async fn sweep_retention(&self, metas: Vec<BlockMeta>) -> Result<Vec<BlockMeta>> {
        if self.config.retention.is_zero() {
            return Ok(metas);
        }
        let cutoff = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
            - self.config.retention.as_nanos() as i64;
        let mut kept = Vec::with_capacity(metas.len());
        for meta in metas {
            if meta.max_time_unix_nanos < cutoff {
                info!(tenant = %meta.tenant_id, block = %meta.block_id, "retention expired");
                self.store.delete_block(&meta).await?;
            } else {
                kept.push(meta);
            }
        }
        Ok(kept)
    }

    /// Merge one claimed input set into a single output block.
    async fn compact_set(&self, tenant: &TenantId, inputs: &[BlockMeta]) -> Result<()> {
        let claim_key = claim_key(inputs);
        self.try_claim(&claim_key)?;
        let result = self.merge_and_commit(tenant, inputs).await;
        self.claims.remove(&claim_key);
        result
    }

    async fn merge_and_commit(&self, tenant: &TenantId, inputs: &[BlockMeta]) -> Result<()> {
        let mut merged: BTreeMap<TraceId, Vec<Span>> = BTreeMap::new();
        let mut level = 0;
        for meta in inputs {
            level = level.max(meta.compaction_level);
            let reader = self.store.read_block(meta).await?;
            for item in reader.iter_traces() {
                let (trace_id, spans) = item?;
                merged.entry(trace_id).or_default().extend(spans);
            }
        }

        // Same trace across input blocks becomes one entry; a span can only
        // appear twice through distributor retries, so dedupe by span ID.
        let mut span_count = 0;
        for spans in merged.values_mut() {
            let mut seen = std::collections::HashSet::new();
            spans.retain(|s| seen.insert(s.span_id));
            spans.sort_by_key(|s| (s.start_unix_nanos, s.span_id));
            span_count += spans.len();
        }

        let output = block::encode_at_level(tenant, &merged, &self.block_config, level + 1)?;
        let output_id = output.meta.block_id;
        self.store.write_block(&output).await?;

        // Output durable; superseded inputs can go.
        for meta in inputs {
            self.store.delete_block(meta).await?;
        }
        info!(
            tenant = %tenant,
            output = %output_id,
            inputs = inputs.len(),
            traces = merged.len(),
            spans = span_count,
            level = level + 1,
            "compacted"
        );
        Ok(())
    }

    fn try_claim(&self, key: &str) -> Result<()> {
        let now = Instant::now();
        let expiry = now + self.config.claim_ttl;
        match self.claims.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut held) => {
                if *held.get() > now {
                    return Err(TraceError::CompactionConflict);
                }
                // Stale lease from a crashed job; take it over.
                held.insert(expiry);
                debug!(claim = key, "took over expired compaction claim");
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(expiry);
                Ok(())
            }
        }
    }

    /// Periodic loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval.max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "compaction cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

fn claim_key(inputs: &[BlockMeta]) -> String {
    let mut ids: Vec<String> = inputs.iter().map(|m| m.block_id.to_string()).collect();
    ids.sort();
    ids.join("+")
}

/// Oldest-first packing: walk blocks in time order and group consecutive ones
/// until the estimated output reaches the target size or the input cap.
/// Groups of one are not worth a rewrite.
fn select_inputs(metas: &[BlockMeta], config: &CompactorConfig) -> Vec<Vec<BlockMeta>> {
    let mut sorted: Vec<BlockMeta> = metas.to_vec();
    sorted.sort_by_key(|m| (m.min_time_unix_nanos, m.block_id));

    let mut jobs = Vec::new();
    let mut current: Vec<BlockMeta> = Vec::new();
    let mut current_bytes = 0u64;
    for meta in sorted {
        if !current.is_empty()
            && (current_bytes + meta.total_bytes > config.target_block_bytes
                || current.len() >= config.max_inputs)
        {
            if current.len() >= 2 {
                jobs.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
            current_bytes = 0;
        }
        current_bytes += meta.total_bytes;
        current.push(meta);
    }
    if current.len() >= 2 {
        jobs.push(current);
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn meta(min: i64, bytes: u64) -> BlockMeta {
        BlockMeta {
            block_id: Uuid::new_v4(),
            tenant_id: "t".into(),
            min_time_unix_nanos: min,
            max_time_unix_nanos: min + 10,
            trace_count: 1,
            span_count: 1,
            total_bytes: bytes,
            bloom_shard_count: 1,
            bloom_fp_rate: 0.01,
            compaction_level: 0,
            created_at: Utc::now(),
        }
    }

    fn config() -> CompactorConfig {
        CompactorConfig {
            target_block_bytes: 100,
            max_inputs: 4,
            ..Default::default()
        }
    }

    #[test]
    fn packs_oldest_first_up_to_target() {
        let metas = vec![meta(30, 40), meta(10, 40), meta(20, 40), meta(40, 40)];
        let jobs = select_inputs(&metas, &config());
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0][0].min_time_unix_nanos, 10);
        assert_eq!(jobs[0].len(), 2);
        assert_eq!(jobs[1].len(), 2);
    }

    #[test]
    fn single_block_is_never_a_job() {
        let metas = vec![meta(10, 40)];
        assert!(select_inputs(&metas, &config()).is_empty());

        // A huge block alone between small ones is skipped, not rewritten.
        let metas = vec![meta(10, 400), meta(20, 40), meta(30, 40)];
        let jobs = select_inputs(&metas, &config());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].len(), 2);
    }

    #[test]
    fn input_cap_limits_job_width() {
        let metas: Vec<BlockMeta> = (0..10).map(|i| meta(i * 10, 1)).collect();
        let jobs = select_inputs(&metas, &config());
        assert!(jobs.iter().all(|j| j.len() <= 4));
        assert_eq!(jobs.iter().map(|j| j.len()).sum::<usize>(), 10);
    }

    #[test]
    fn claim_conflicts_and_expiry() {
        let store = BlockStore::new(Arc::new(crate::backend::MemoryStore::new()));
        let mut cfg = config();
        cfg.claim_ttl = Duration::from_millis(1);
        let compactor = Compactor::new(cfg, BlockConfig::default(), store);

        compactor.try_claim("a+b").unwrap();
        assert!(matches!(
            compactor.try_claim("a+b"),
            Err(TraceError::CompactionConflict)
        ));
        std::thread::sleep(Duration::from_millis(5));
        // Expired lease can be retaken.
        compactor.try_claim("a+b").unwrap();
    }
}
