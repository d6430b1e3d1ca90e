//! Ingester: accumulates spans in memory per tenant and flushes immutable
//! blocks to the backing store.
//!
//! Shard lifecycle per tenant: ACTIVE head → cut (size or age) → frozen queue
//! → flush with backoff → durable block, buffer dropped. Flush failures keep
//! the buffer queued; data is only lost on ungraceful termination.

pub mod shard;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::BlockStore;
use crate::block;
use crate::config::{BlockConfig, IngesterConfig};
use crate::error::{Result, TraceError};
use crate::model::{Span, TenantId, TraceId};
use crate::ring::ReplicaId;

use shard::TenantShard;

/// Seam between the routing components and an ingester replica. In-process
/// replicas implement it directly; a remote transport would sit behind the
/// same trait.
#[async_trait::async_trait]
pub trait IngesterHandle: Send + Sync {
    fn replica_id(&self) -> &ReplicaId;

    async fn push_spans(&self, tenant: &TenantId, spans: Vec<Span>) -> Result<()>;

    async fn query_trace(&self, tenant: &TenantId, trace_id: &TraceId) -> Result<Vec<Span>>;

    /// Everything buffered for a tenant, for live search scans.
    async fn query_buffered(&self, tenant: &TenantId) -> Result<Vec<Span>>;
}

#[async_trait::async_trait]
impl IngesterHandle for Ingester {
    fn replica_id(&self) -> &ReplicaId {
        &self.id
    }

    async fn push_spans(&self, tenant: &TenantId, spans: Vec<Span>) -> Result<()> {
        self.push(tenant, spans)
    }

    async fn query_trace(&self, tenant: &TenantId, trace_id: &TraceId) -> Result<Vec<Span>> {
        Ok(self.spans_for_trace(tenant, trace_id))
    }

    async fn query_buffered(&self, tenant: &TenantId) -> Result<Vec<Span>> {
        Ok(self.buffered_spans(tenant))
    }
}

pub struct Ingester {
    id: ReplicaId,
    config: IngesterConfig,
    block_config: BlockConfig,
    store: BlockStore,
    shards: DashMap<TenantId, Arc<TenantShard>>,
    draining: AtomicBool,
}

impl Ingester {
    pub fn new(
        id: impl Into<ReplicaId>,
        config: IngesterConfig,
        block_config: BlockConfig,
        store: BlockStore,
    ) -> Self {
        Self {
            id: id.into(),
            config,
            block_config,
            store,
            shards: DashMap::new(),
            draining: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    fn shard(&self, tenant: &TenantId) -> Arc<TenantShard> {
        self.shards
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(TenantShard::new(tenant.clone())))
            .clone()
    }

    /// Write path. Never blocks on an in-progress flush; a size-triggered cut
    /// happens inline so the head is bounded.
    pub fn push(&self, tenant: &TenantId, spans: Vec<Span>) -> Result<()> {
        if self.draining.load(Ordering::Acquire) {
            return Err(TraceError::ShuttingDown);
        }
        if spans.is_empty() {
            return Ok(());
        }
        let shard = self.shard(tenant);
        if shard.push(spans, &self.config) {
            shard.cut();
        }
        Ok(())
    }

    /// Live-query surface used by queriers for not-yet-flushed data.
    pub fn spans_for_trace(&self, tenant: &TenantId, trace_id: &TraceId) -> Vec<Span> {
        match self.shards.get(tenant) {
            Some(shard) => shard.spans_for_trace(trace_id),
            None => Vec::new(),
        }
    }

    /// All buffered spans for a tenant, for live search.
    pub fn buffered_spans(&self, tenant: &TenantId) -> Vec<Span> {
        match self.shards.get(tenant) {
            Some(shard) => shard.all_spans(),
            None => Vec::new(),
        }
    }

    /// Age-based cuts across all tenants.
    pub fn cut_stale(&self) {
        for entry in self.shards.iter() {
            if entry.value().cut_if_stale(&self.config) {
                debug!(ingester = %self.id, tenant = %entry.key(), "cut stale buffer");
            }
        }
    }

    /// One flush pass: every frozen buffer that is due gets one attempt.
    /// Failed buffers are re-queued with exponential backoff, never dropped.
    /// The buffer under flush stays queryable until its block commits.
    pub async fn flush_pending(&self) -> usize {
        let now = Instant::now();
        let shards: Vec<Arc<TenantShard>> =
            self.shards.iter().map(|e| e.value().clone()).collect();

        let mut flushed = 0;
        for shard in shards {
            while let Some(mut buffer) = shard.take_flushable(now) {
                match self.flush_buffer(&shard.tenant, &buffer.traces).await {
                    Ok(block_id) => {
                        shard.complete_flush();
                        info!(
                            ingester = %self.id,
                            tenant = %shard.tenant,
                            block = %block_id,
                            spans = buffer.span_count,
                            bytes = buffer.bytes,
                            "buffer flushed"
                        );
                        flushed += 1;
                    }
                    Err(e) => {
                        buffer.attempts += 1;
                        let backoff = backoff_for(&self.config, buffer.attempts);
                        warn!(
                            ingester = %self.id,
                            tenant = %shard.tenant,
                            attempts = buffer.attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "flush failed, will retry"
                        );
                        buffer.not_before = Instant::now() + backoff;
                        shard.requeue(buffer);
                        break;
                    }
                }
            }
        }
        flushed
    }

    async fn flush_buffer(
        &self,
        tenant: &TenantId,
        traces: &std::collections::BTreeMap<TraceId, Vec<Span>>,
    ) -> Result<block::BlockId> {
        let encoded = block::encode(tenant, traces, &self.block_config)?;
        let block_id = encoded.meta.block_id;
        self.store
            .write_block(&encoded)
            .await
            .map_err(|e| TraceError::Flush(e.to_string()))?;
        Ok(block_id)
    }

    /// Total buffered-but-unflushed volume across tenants: (bytes, spans).
    pub fn unflushed(&self) -> (usize, usize) {
        self.shards.iter().fold((0, 0), |(b, s), entry| {
            let (bytes, spans) = entry.value().unflushed();
            (b + bytes, s + spans)
        })
    }

    /// Graceful shutdown: stop accepting writes, cut every head, and keep
    /// flushing until nothing is buffered.
    pub async fn drain(&self) {
        self.draining.store(true, Ordering::Release);
        for entry in self.shards.iter() {
            entry.value().cut();
        }
        loop {
            self.flush_pending().await;
            let (bytes, spans) = self.unflushed();
            if spans == 0 {
                break;
            }
            debug!(ingester = %self.id, bytes, spans, "drain waiting on flushes");
            tokio::time::sleep(self.config.flush_backoff_min).await;
        }
        info!(ingester = %self.id, "drained");
    }

    /// Background loop: periodic age cuts and flush passes until shutdown,
    /// then a drain.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cut_stale();
                    self.flush_pending().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.drain().await;
                        return;
                    }
                }
            }
        }
    }
}

fn backoff_for(config: &IngesterConfig, attempts: u32) -> Duration {
    let base = config.flush_backoff_min.max(Duration::from_millis(1));
    let exp = base.saturating_mul(1u32 << attempts.min(16).saturating_sub(1));
    exp.min(config.flush_backoff_max)
}
