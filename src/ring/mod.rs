//! Consistent-hash ring for replica ownership.
//!
//! Membership lives in an immutable snapshot behind a lock; lookups clone the
//! `Arc` and walk it lock-free, so a concurrent join/leave never blocks or
//! tears a read. Updates rebuild the whole snapshot and swap it in.

use std::sync::Arc;

use parking_lot::RwLock;
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

use crate::model::TraceId;

pub type ReplicaId = String;

const DEFAULT_TOKENS_PER_REPLICA: usize = 64;

/// One immutable generation of ring membership.
#[derive(Debug, Clone, Default)]
pub struct RingState {
    /// (token, owner), sorted by token.
    tokens: Vec<(u64, ReplicaId)>,
    replicas: Vec<ReplicaId>,
}

impl RingState {
    fn build(members: &[(ReplicaId, usize)]) -> Self {
        let mut tokens = Vec::new();
        for (replica, token_count) in members {
            for i in 0..*token_count {
                // Deterministic tokens: stable placement across restarts.
                let token = xxh3_64_with_seed(replica.as_bytes(), i as u64);
                tokens.push((token, replica.clone()));
            }
        }
        tokens.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut replicas: Vec<ReplicaId> = members.iter().map(|(r, _)| r.clone()).collect();
        replicas.sort();
        Self { tokens, replicas }
    }

    pub fn replicas(&self) -> &[ReplicaId] {
        &self.replicas
    }

    /// Walk clockwise from the key's token, collecting the first `n` distinct
    /// replicas.
    pub fn replicas_for(&self, trace_id: &TraceId, n: usize) -> Vec<ReplicaId> {
        if self.tokens.is_empty() || n == 0 {
            return Vec::new();
        }
        let hash = xxh3_64(trace_id.as_bytes());
        let start = self
            .tokens
            .partition_point(|(token, _)| *token < hash)
            % self.tokens.len();

        let want = n.min(self.replicas.len());
        let mut owners: Vec<ReplicaId> = Vec::with_capacity(want);
        for i in 0..self.tokens.len() {
            let (_, replica) = &self.tokens[(start + i) % self.tokens.len()];
            if !owners.contains(replica) {
                owners.push(replica.clone());
                if owners.len() == want {
                    break;
                }
            }
        }
        owners
    }
}

/// Shared ring handle. Cheap to clone; all clones see membership updates.
#[derive(Clone)]
pub struct Ring {
    state: Arc<RwLock<Arc<RingState>>>,
    tokens_per_replica: usize,
    members: Arc<RwLock<Vec<(ReplicaId, usize)>>>,
}

impl Default for Ring {
    fn default() -> Self {
        Self::new(DEFAULT_TOKENS_PER_REPLICA)
    }
}

impl Ring {
    pub fn new(tokens_per_replica: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(Arc::new(RingState::default()))),
            tokens_per_replica: tokens_per_replica.max(1),
            members: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Consistent point-in-time view; never blocks on membership changes
    /// beyond the snapshot pointer read.
    pub fn snapshot(&self) -> Arc<RingState> {
        self.state.read().clone()
    }

    pub fn join(&self, replica: impl Into<ReplicaId>) {
        self.join_weighted(replica, self.tokens_per_replica);
    }

    /// Join with an explicit token count, for uneven replica sizing.
    pub fn join_weighted(&self, replica: impl Into<ReplicaId>, token_count: usize) {
        let replica = replica.into();
        let mut members = self.members.write();
        members.retain(|(r, _)| *r != replica);
        members.push((replica, token_count.max(1)));
        self.swap_in(&members);
    }

    pub fn leave(&self, replica: &str) {
        let mut members = self.members.write();
        members.retain(|(r, _)| r != replica);
        self.swap_in(&members);
    }

    fn swap_in(&self, members: &[(ReplicaId, usize)]) {
        let next = Arc::new(RingState::build(members));
        *self.state.write() = next;
    }

    pub fn replicas_for(&self, trace_id: &TraceId, n: usize) -> Vec<ReplicaId> {
        self.snapshot().replicas_for(trace_id, n)
    }

    pub fn replica_count(&self) -> usize {
        self.snapshot().replicas().len()
    }
}
