//! End-to-end write/read path: distributor → ingesters → blocks → querier →
//! frontend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracedb_core::backend::{BlockStore, MemoryStore};
use tracedb_core::config::{
    BlockConfig, DistributorConfig, IngesterConfig, QueryConfig, QuorumPolicy,
};
use tracedb_core::distributor::Distributor;
use tracedb_core::error::{Result, TraceError};
use tracedb_core::frontend::QueryFrontend;
use tracedb_core::ingester::{Ingester, IngesterHandle};
use tracedb_core::model::{AttrValue, Span, SpanId, SpanStatus, TraceId};
use tracedb_core::querier::{Querier, SearchQuery};
use tracedb_core::ring::Ring;

fn span(trace: u64, id: u64, start: i64) -> Span {
    Span {
        trace_id: TraceId::from_u64(trace),
        span_id: SpanId::from_u64(id),
        parent_span_id: if id % 10 == 0 { None } else { Some(SpanId::from_u64(id - 1)) },
        service: "api".into(),
        operation: "GET /orders".into(),
        start_unix_nanos: start,
        duration_nanos: 1_000,
        attributes: HashMap::from([("env".to_string(), AttrValue::String("prod".into()))]),
        status: SpanStatus::Ok,
    }
}

struct Cluster {
    store: BlockStore,
    ring: Ring,
    ingesters: Vec<Arc<Ingester>>,
    distributor: Distributor,
    querier: Arc<Querier>,
}

fn cluster(replicas: usize, quorum: QuorumPolicy) -> Cluster {
    let store = BlockStore::new(Arc::new(MemoryStore::new()));
    let ring = Ring::new(32);
    let mut ingesters = Vec::new();
    for i in 0..replicas {
        let id = format!("ingester-{}", i);
        ring.join(id.clone());
        ingesters.push(Arc::new(Ingester::new(
            id,
            IngesterConfig::default(),
            BlockConfig::default(),
            store.clone(),
        )));
    }
    let handles: Vec<Arc<dyn IngesterHandle>> = ingesters
        .iter()
        .map(|i| i.clone() as Arc<dyn IngesterHandle>)
        .collect();
    let distributor = Distributor::new(
        DistributorConfig {
            replication_factor: replicas.min(3),
            quorum,
        },
        ring.clone(),
        handles.clone(),
    );
    let querier = Arc::new(Querier::new(
        ring.clone(),
        replicas.min(3),
        handles,
        store.clone(),
    ));
    Cluster {
        store,
        ring,
        ingesters,
        distributor,
        querier,
    }
}

#[tokio::test]
async fn flushed_spans_are_returned_exactly_once() {
    let cluster = cluster(3, QuorumPolicy::All);
    let tenant = "acme".to_string();

    // 20 traces, 3 spans each, replicated to 3 ingesters.
    for t in 1..=20u64 {
        let spans: Vec<Span> = (0..3).map(|s| span(t, t * 10 + s, t as i64 * 1_000)).collect();
        cluster.distributor.push(&tenant, spans).await.unwrap();
    }
    for ingester in &cluster.ingesters {
        ingester.drain().await;
    }

    // Every replica flushed its own block, so each span exists in several
    // blocks; the querier must still return it exactly once.
    for t in 1..=20u64 {
        let result = cluster
            .querier
            .find_trace(&tenant, &TraceId::from_u64(t))
            .await
            .unwrap();
        assert!(!result.partial);
        let trace = result.trace.expect("trace must be found");
        assert_eq!(trace.spans.len(), 3, "trace {} span count", t);
    }
}

#[tokio::test]
async fn trace_split_across_flush_windows_is_merged() {
    let cluster = cluster(1, QuorumPolicy::All);
    let tenant = "acme".to_string();
    let trace_id = TraceId::from_u64(7);

    // First window → block B1.
    cluster
        .distributor
        .push(&tenant, vec![span(7, 70, 1_000), span(7, 71, 2_000)])
        .await
        .unwrap();
    cluster.ingesters[0].drain().await;

    // The ingester is drained; bring up a replacement for the next window.
    let late = Arc::new(Ingester::new(
        "ingester-0b",
        IngesterConfig::default(),
        BlockConfig::default(),
        cluster.store.clone(),
    ));
    late.push(&tenant, vec![span(7, 72, 3_000)]).unwrap();
    late.drain().await;

    let metas = cluster.store.list_blocks(&tenant).await.unwrap();
    assert_eq!(metas.len(), 2, "two flush windows, two blocks");

    let result = cluster.querier.find_trace(&tenant, &trace_id).await.unwrap();
    let trace = result.trace.expect("trace spans both blocks");
    assert_eq!(trace.spans.len(), 3);
    let starts: Vec<i64> = trace.spans.iter().map(|s| s.start_unix_nanos).collect();
    assert_eq!(starts, vec![1_000, 2_000, 3_000]);
}

#[tokio::test]
async fn buffered_and_flushed_copies_dedupe() {
    let cluster = cluster(2, QuorumPolicy::All);
    let tenant = "acme".to_string();

    cluster
        .distributor
        .push(&tenant, vec![span(5, 50, 100)])
        .await
        .unwrap();

    // Replica 0 flushed; replica 1 still buffers the same span.
    cluster.ingesters[0].drain().await;

    let result = cluster
        .querier
        .find_trace(&tenant, &TraceId::from_u64(5))
        .await
        .unwrap();
    assert_eq!(result.trace.unwrap().spans.len(), 1);
}

#[tokio::test]
async fn missing_trace_is_not_found_not_an_error() {
    let cluster = cluster(2, QuorumPolicy::All);
    let result = cluster
        .querier
        .find_trace(&"acme".to_string(), &TraceId::from_u64(404))
        .await
        .unwrap();
    assert!(result.trace.is_none());
    assert!(!result.partial);
}

#[tokio::test]
async fn search_finds_traces_in_blocks_and_buffers() {
    let cluster = cluster(1, QuorumPolicy::All);
    let tenant = "acme".to_string();

    cluster
        .distributor
        .push(&tenant, vec![span(1, 10, 1_000), span(2, 20, 2_000)])
        .await
        .unwrap();
    cluster.ingesters[0].cut_stale(); // no-op, head is fresh
    cluster.ingesters[0].drain().await;

    // One more trace that stays buffered.
    let live = Arc::new(Ingester::new(
        "ingester-live",
        IngesterConfig::default(),
        BlockConfig::default(),
        cluster.store.clone(),
    ));
    live.push(&tenant, vec![span(3, 30, 3_000)]).unwrap();
    let handles: Vec<Arc<dyn IngesterHandle>> = vec![live.clone()];
    let querier = Querier::new(cluster.ring.clone(), 1, handles, cluster.store.clone());

    let result = querier
        .search(
            &tenant,
            &SearchQuery {
                start_unix_nanos: 0,
                end_unix_nanos: 10_000,
                service: Some("api".into()),
                limit: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let ids: Vec<TraceId> = result.summaries.iter().map(|s| s.trace_id).collect();
    assert_eq!(
        ids,
        vec![TraceId::from_u64(3), TraceId::from_u64(2), TraceId::from_u64(1)],
        "newest first, blocks and buffers unioned"
    );
}

struct HungReplica {
    id: String,
}

#[async_trait::async_trait]
impl IngesterHandle for HungReplica {
    fn replica_id(&self) -> &String {
        &self.id
    }

    async fn push_spans(&self, _: &String, _: Vec<Span>) -> Result<()> {
        Ok(())
    }

    async fn query_trace(&self, _: &String, _: &TraceId) -> Result<Vec<Span>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }

    async fn query_buffered(&self, _: &String) -> Result<Vec<Span>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_returns_truncated_results_from_reachable_shards() {
    let store = BlockStore::new(Arc::new(MemoryStore::new()));
    let ring = Ring::new(32);

    // Healthy path: one ingester with buffered data.
    let healthy = Arc::new(Ingester::new(
        "ingester-ok",
        IngesterConfig::default(),
        BlockConfig::default(),
        store.clone(),
    ));
    ring.join("ingester-ok");
    let tenant = "acme".to_string();
    healthy.push(&tenant, vec![span(1, 10, 50)]).unwrap();

    let good = Arc::new(Querier::new(
        ring.clone(),
        1,
        vec![healthy.clone() as Arc<dyn IngesterHandle>],
        store.clone(),
    ));
    let hung = Arc::new(Querier::new(
        ring.clone(),
        1,
        vec![Arc::new(HungReplica { id: "ingester-hung".into() }) as Arc<dyn IngesterHandle>],
        store.clone(),
    ));

    // Round-robin over [good, hung]: five shards land on both queriers; the
    // hung ones must not stall the response past the deadline.
    let frontend = QueryFrontend::new(
        QueryConfig {
            shard_window: Duration::from_nanos(100),
            max_concurrent_shards: 5,
            deadline: Duration::from_secs(2),
            limit: 10,
        },
        vec![good, hung],
    );

    let response = frontend
        .search(
            &tenant,
            SearchQuery {
                start_unix_nanos: 0,
                end_unix_nanos: 450,
                limit: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(response.truncated, "deadline must truncate, not hang");
    assert_eq!(response.summaries.len(), 1, "reachable shards still answer");
}

#[tokio::test]
async fn quorum_write_survives_one_dead_replica() {
    let store = BlockStore::new(Arc::new(MemoryStore::new()));
    let ring = Ring::new(32);
    let tenant = "acme".to_string();

    let alive_a = Arc::new(Ingester::new(
        "ingester-0",
        IngesterConfig::default(),
        BlockConfig::default(),
        store.clone(),
    ));
    let alive_b = Arc::new(Ingester::new(
        "ingester-1",
        IngesterConfig::default(),
        BlockConfig::default(),
        store.clone(),
    ));
    // Drained ingester rejects writes: a permanently failing replica.
    let dead = Arc::new(Ingester::new(
        "ingester-2",
        IngesterConfig::default(),
        BlockConfig::default(),
        store.clone(),
    ));
    dead.drain().await;

    for id in ["ingester-0", "ingester-1", "ingester-2"] {
        ring.join(id);
    }
    let handles: Vec<Arc<dyn IngesterHandle>> = vec![
        alive_a.clone(),
        alive_b.clone(),
        dead.clone(),
    ];

    let majority = Distributor::new(
        DistributorConfig {
            replication_factor: 3,
            quorum: QuorumPolicy::Majority,
        },
        ring.clone(),
        handles.clone(),
    );
    majority.push(&tenant, vec![span(1, 10, 100)]).await.unwrap();

    let all = Distributor::new(
        DistributorConfig {
            replication_factor: 3,
            quorum: QuorumPolicy::All,
        },
        ring,
        handles,
    );
    let err = all.push(&tenant, vec![span(2, 20, 100)]).await.unwrap_err();
    assert!(matches!(err, TraceError::WriteQuorum { .. }));
}
