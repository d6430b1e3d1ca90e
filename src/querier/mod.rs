//! Querier: resolves trace lookups and searches against live ingester state
//! plus backend blocks.
//!
//! A trace-ID lookup fans out to the owning ingesters and to every block that
//! could hold the trace (bloom shard → index → region decode), then merges
//! everything, deduplicating by span ID. Unreachable shards mark the result
//! partial instead of failing it; an absent trace is `None`, not an error.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::warn;

use crate::backend::BlockStore;
use crate::error::Result;
use crate::ingester::IngesterHandle;
use crate::model::{AttrValue, Span, TenantId, Trace, TraceId, TraceSummary};
use crate::ring::{ReplicaId, Ring};

/// Structured search predicate: equality filters plus a time window. The full
/// predicate grammar lives with an external collaborator; this is its landing
/// contract.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub start_unix_nanos: i64,
    pub end_unix_nanos: i64,
    pub service: Option<String>,
    pub operation: Option<String>,
    pub attributes: Vec<(String, AttrValue)>,
    pub min_duration_nanos: Option<u64>,
    pub limit: usize,
}

impl SearchQuery {
    /// Does a single span satisfy every filter?
    pub fn matches(&self, span: &Span) -> bool {
        if span.start_unix_nanos > self.end_unix_nanos
            || span.end_unix_nanos() < self.start_unix_nanos
        {
            return false;
        }
        if let Some(service) = &self.service {
            if &span.service != service {
                return false;
            }
        }
        if let Some(operation) = &self.operation {
            if &span.operation != operation {
                return false;
            }
        }
        if let Some(min) = self.min_duration_nanos {
            if span.duration_nanos < min {
                return false;
            }
        }
        self.attributes
            .iter()
            .all(|(k, v)| span.attributes.get(k) == Some(v))
    }
}

#[derive(Debug, Clone)]
pub struct TraceQueryResult {
    pub trace: Option<Trace>,
    /// Some ingester or block was unreachable; the answer is best-effort.
    pub partial: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub summaries: Vec<TraceSummary>,
    pub partial: bool,
}

pub struct Querier {
    ring: Ring,
    replication_factor: usize,
    ingesters: HashMap<ReplicaId, Arc<dyn IngesterHandle>>,
    store: BlockStore,
}

impl Querier {
    pub fn new(
        ring: Ring,
        replication_factor: usize,
        ingesters: Vec<Arc<dyn IngesterHandle>>,
        store: BlockStore,
    ) -> Self {
        let ingesters = ingesters
            .into_iter()
            .map(|i| (i.replica_id().clone(), i))
            .collect();
        Self {
            ring,
            replication_factor,
            ingesters,
            store,
        }
    }

    /// Assemble a trace from live buffers and blocks.
    pub async fn find_trace(&self, tenant: &TenantId, trace_id: &TraceId) -> Result<TraceQueryResult> {
        let mut partial = false;
        let mut spans: Vec<Span> = Vec::new();

        // Live state from the owning replicas, in parallel.
        let owners = self.ring.replicas_for(trace_id, self.replication_factor);
        let live = owners.iter().filter_map(|id| self.ingesters.get(id)).map(|handle| {
            let handle = handle.clone();
            let tenant = tenant.clone();
            let trace_id = *trace_id;
            async move { handle.query_trace(&tenant, &trace_id).await }
        });
        for outcome in join_all(live).await {
            match outcome {
                Ok(found) => spans.extend(found),
                Err(e) => {
                    warn!(trace = %trace_id, error = %e, "ingester unreachable during lookup");
                    partial = true;
                }
            }
        }

        // Backend blocks, bloom-pruned. A trace-ID lookup carries no time
        // hint, so every committed block is a candidate.
        match self.store.list_blocks(tenant).await {
            Ok(metas) => {
                let lookups = metas.iter().map(|meta| self.store.find_trace_in_block(meta, trace_id));
                for outcome in join_all(lookups).await {
                    match outcome {
                        Ok(Some(found)) => spans.extend(found),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(trace = %trace_id, error = %e, "block unreachable during lookup");
                            partial = true;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(trace = %trace_id, error = %e, "block discovery failed");
                partial = true;
            }
        }

        let trace = if spans.is_empty() {
            None
        } else {
            Some(Trace::assemble(*trace_id, spans))
        };
        Ok(TraceQueryResult { trace, partial })
    }

    /// Scan candidate blocks and live buffers for traces matching the query.
    pub async fn search(&self, tenant: &TenantId, query: &SearchQuery) -> Result<SearchResult> {
        let mut partial = false;
        // trace id -> all spans seen for it (for summaries), plus match flag.
        let mut traces: HashMap<TraceId, (Vec<Span>, bool)> = HashMap::new();

        let mut note = |span: Span, matched: bool| {
            let slot = traces.entry(span.trace_id).or_insert_with(|| (Vec::new(), false));
            slot.1 |= matched;
            slot.0.push(span);
        };

        // Blocks overlapping the window.
        match self.store.list_blocks(tenant).await {
            Ok(metas) => {
                for meta in metas
                    .iter()
                    .filter(|m| m.overlaps(query.start_unix_nanos, query.end_unix_nanos))
                {
                    match self.store.read_block(meta).await {
                        Ok(reader) => {
                            for item in reader.iter_traces() {
                                match item {
                                    Ok((_, spans)) => {
                                        for span in spans {
                                            let matched = query.matches(&span);
                                            note(span, matched);
                                        }
                                    }
                                    Err(e) => {
                                        warn!(block = %meta.block_id, error = %e, "corrupt record skipped");
                                        partial = true;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(block = %meta.block_id, error = %e, "block unreachable during search");
                            partial = true;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "block discovery failed during search");
                partial = true;
            }
        }

        // Live buffers from every replica.
        let live = self.ingesters.values().map(|handle| {
            let handle = handle.clone();
            let tenant = tenant.clone();
            async move { handle.query_buffered(&tenant).await }
        });
        for outcome in join_all(live).await {
            match outcome {
                Ok(spans) => {
                    for span in spans {
                        let matched = query.matches(&span);
                        note(span, matched);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "ingester unreachable during search");
                    partial = true;
                }
            }
        }

        let mut summaries: Vec<TraceSummary> = traces
            .into_iter()
            .filter(|(_, (_, matched))| *matched)
            .map(|(trace_id, (mut spans, _))| {
                let mut seen = std::collections::HashSet::new();
                spans.retain(|s| seen.insert(s.span_id));
                TraceSummary::from_spans(trace_id, &spans)
            })
            .collect();
        summaries.sort_by_key(|s| std::cmp::Reverse((s.start_unix_nanos, s.trace_id)));
        if query.limit > 0 {
            summaries.truncate(query.limit);
        }
        Ok(SearchResult { summaries, partial })
    }
}
