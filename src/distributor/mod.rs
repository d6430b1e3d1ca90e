//! Distributor: the stateless write front door.
//!
//! Groups an incoming batch by trace ID, resolves each trace's replica set
//! from the ring, forwards to all replicas in parallel, and accepts the batch
//! once every trace reached its quorum. A single slow or dead replica never
//! fails a write while quorum is still reachable.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::config::DistributorConfig;
use crate::error::{Result, TraceError};
use crate::ingester::IngesterHandle;
use crate::model::{Span, TenantId, TraceId};
use crate::ring::{ReplicaId, Ring};

pub struct Distributor {
    config: DistributorConfig,
    ring: Ring,
    replicas: HashMap<ReplicaId, Arc<dyn IngesterHandle>>,
}

impl Distributor {
    pub fn new(
        config: DistributorConfig,
        ring: Ring,
        replicas: Vec<Arc<dyn IngesterHandle>>,
    ) -> Self {
        let replicas = replicas
            .into_iter()
            .map(|r| (r.replica_id().clone(), r))
            .collect();
        Self {
            config,
            ring,
            replicas,
        }
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Accept a batch of spans for a tenant. Fails with `WriteQuorum` when
    /// any trace in the batch misses its quorum; the caller should retry the
    /// whole batch (replicas dedupe at query time, so retries are safe).
    pub async fn push(&self, tenant: &TenantId, spans: Vec<Span>) -> Result<()> {
        if spans.is_empty() {
            return Ok(());
        }

        // Group by trace and resolve ownership once per trace.
        let mut by_trace: HashMap<TraceId, Vec<Span>> = HashMap::new();
        for span in spans {
            by_trace.entry(span.trace_id).or_default().push(span);
        }

        let snapshot = self.ring.snapshot();
        let mut owners: HashMap<TraceId, Vec<ReplicaId>> = HashMap::with_capacity(by_trace.len());
        let mut per_replica: HashMap<ReplicaId, Vec<Span>> = HashMap::new();
        for (trace_id, group) in &by_trace {
            let set = snapshot.replicas_for(trace_id, self.config.replication_factor);
            if set.is_empty() {
                return Err(TraceError::Internal("ring has no replicas".into()));
            }
            for replica in &set {
                per_replica
                    .entry(replica.clone())
                    .or_default()
                    .extend(group.iter().cloned());
            }
            owners.insert(*trace_id, set);
        }

        // One parallel push per involved replica.
        let sends = per_replica.into_iter().map(|(replica_id, batch)| {
            let handle = self.replicas.get(&replica_id).cloned();
            let tenant = tenant.clone();
            async move {
                let outcome = match handle {
                    Some(handle) => handle.push_spans(&tenant, batch).await,
                    None => Err(TraceError::Internal(format!(
                        "unknown replica {}",
                        replica_id
                    ))),
                };
                (replica_id, outcome)
            }
        });

        let mut acked: HashMap<ReplicaId, bool> = HashMap::new();
        for (replica_id, outcome) in join_all(sends).await {
            match outcome {
                Ok(()) => {
                    acked.insert(replica_id, true);
                }
                Err(e) => {
                    warn!(replica = %replica_id, error = %e, "replica push failed");
                    acked.insert(replica_id, false);
                }
            }
        }

        // Quorum is judged per trace against its own replica set.
        for (trace_id, set) in owners {
            let required = self.config.quorum.required(set.len());
            let got = set
                .iter()
                .filter(|r| acked.get(*r).copied().unwrap_or(false))
                .count();
            if got < required {
                return Err(TraceError::WriteQuorum {
                    acked: got,
                    required,
                });
            }
            debug!(trace = %trace_id, acked = got, required, "trace accepted");
        }
        Ok(())
    }
}
