//! Query frontend: the stateless query entry point.
//!
//! A search is split into fixed time shards, dispatched to a pool of queriers
//! with a global in-flight cap, and merged as results land. A deadline bounds
//! the whole query: on expiry the merged best-effort result is returned with
//! a truncation indicator and outstanding shard work is abandoned (tasks
//! finish detached and their results are dropped).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::QueryConfig;
use crate::error::Result;
use crate::model::{TenantId, Trace, TraceId, TraceSummary};
use crate::querier::{Querier, SearchQuery};

#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub summaries: Vec<TraceSummary>,
    /// Some shard or backend was unreachable.
    pub partial: bool,
    /// The deadline elapsed before every shard completed.
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct TraceResponse {
    pub trace: Option<Trace>,
    pub partial: bool,
    pub truncated: bool,
}

pub struct QueryFrontend {
    config: QueryConfig,
    queriers: Vec<Arc<Querier>>,
    shard_permits: Arc<Semaphore>,
    next: AtomicUsize,
}

impl QueryFrontend {
    pub fn new(config: QueryConfig, queriers: Vec<Arc<Querier>>) -> Self {
        let permits = config.max_concurrent_shards.max(1);
        Self {
            config,
            queriers,
            shard_permits: Arc::new(Semaphore::new(permits)),
            next: AtomicUsize::new(0),
        }
    }

    fn next_querier(&self) -> Arc<Querier> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.queriers.len();
        self.queriers[i].clone()
    }

    /// Split the query window into per-shard sub-queries.
    fn shard_queries(&self, query: &SearchQuery) -> Vec<SearchQuery> {
        let window = self.config.shard_window.as_nanos() as i64;
        if window <= 0 || query.end_unix_nanos <= query.start_unix_nanos {
            return vec![query.clone()];
        }
        let mut shards = Vec::new();
        let mut start = query.start_unix_nanos;
        while start <= query.end_unix_nanos {
            let end = (start + window - 1).min(query.end_unix_nanos);
            let mut shard = query.clone();
            shard.start_unix_nanos = start;
            shard.end_unix_nanos = end;
            shards.push(shard);
            start = end + 1;
        }
        shards
    }

    pub async fn search(&self, tenant: &TenantId, mut query: SearchQuery) -> Result<SearchResponse> {
        if self.queriers.is_empty() {
            return Err(crate::error::TraceError::Internal("no queriers available".into()));
        }
        if query.limit == 0 {
            query.limit = self.config.limit;
        }
        let shards = self.shard_queries(&query);
        debug!(tenant = %tenant, shards = shards.len(), "dispatching search");

        let deadline = tokio::time::Instant::now() + self.config.deadline;
        let mut pending = FuturesUnordered::new();
        for shard in shards {
            let querier = self.next_querier();
            let permits = self.shard_permits.clone();
            let tenant = tenant.clone();
            pending.push(tokio::spawn(async move {
                // Global in-flight cap: dispatch stalls here under saturation.
                let _permit = permits.acquire_owned().await.ok();
                querier.search(&tenant, &shard).await
            }));
        }

        let mut response = SearchResponse::default();
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        while !pending.is_empty() {
            tokio::select! {
                _ = &mut sleep => {
                    warn!(tenant = %tenant, outstanding = pending.len(), "query deadline reached");
                    response.truncated = true;
                    break;
                }
                Some(joined) = pending.next() => match joined {
                    Ok(Ok(result)) => {
                        response.partial |= result.partial;
                        response.summaries.extend(result.summaries);
                    }
                    Ok(Err(e)) => {
                        warn!(tenant = %tenant, error = %e, "search shard failed");
                        response.partial = true;
                    }
                    Err(e) => {
                        warn!(tenant = %tenant, error = %e, "search shard panicked");
                        response.partial = true;
                    }
                },
            }
        }

        merge_summaries(&mut response.summaries, query.limit);
        Ok(response)
    }

    /// Trace-ID lookup: a single shard of work, still under the deadline.
    pub async fn find_trace(&self, tenant: &TenantId, trace_id: &TraceId) -> Result<TraceResponse> {
        if self.queriers.is_empty() {
            return Err(crate::error::TraceError::Internal("no queriers available".into()));
        }
        let querier = self.next_querier();
        let tenant_owned = tenant.clone();
        let trace_id = *trace_id;
        let lookup = tokio::spawn(async move { querier.find_trace(&tenant_owned, &trace_id).await });

        match tokio::time::timeout(self.config.deadline, lookup).await {
            Ok(Ok(Ok(result))) => Ok(TraceResponse {
                trace: result.trace,
                partial: result.partial,
                truncated: false,
            }),
            Ok(Ok(Err(e))) => {
                warn!(tenant = %tenant, trace = %trace_id, error = %e, "trace lookup failed");
                Ok(TraceResponse {
                    trace: None,
                    partial: true,
                    truncated: false,
                })
            }
            Ok(Err(join_err)) => {
                warn!(tenant = %tenant, error = %join_err, "trace lookup panicked");
                Ok(TraceResponse {
                    trace: None,
                    partial: true,
                    truncated: false,
                })
            }
            Err(_) => Ok(TraceResponse {
                trace: None,
                partial: true,
                truncated: true,
            }),
        }
    }
}

/// Union of shard results: the same trace seen from several shards keeps its
/// most complete summary; newest traces first; limit applied last.
fn merge_summaries(summaries: &mut Vec<TraceSummary>, limit: usize) {
    let mut best: std::collections::HashMap<TraceId, TraceSummary> = std::collections::HashMap::new();
    for summary in summaries.drain(..) {
        match best.get(&summary.trace_id) {
            Some(existing) if existing.span_count >= summary.span_count => {}
            _ => {
                best.insert(summary.trace_id, summary);
            }
        }
    }
    summaries.extend(best.into_values());
    summaries.sort_by_key(|s| std::cmp::Reverse((s.start_unix_nanos, s.trace_id)));
    if limit > 0 {
        summaries.truncate(limit);
    }
}
