use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use tracedb_core::backend::{BlockStore, LocalStore};
use tracedb_core::compactor::Compactor;
use tracedb_core::distributor::Distributor;
use tracedb_core::frontend::QueryFrontend;
use tracedb_core::ingester::{Ingester, IngesterHandle};
use tracedb_core::querier::Querier;
use tracedb_core::ring::Ring;
use tracedb_core::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let data_dir = std::env::var("TRACEDB_DATA_DIR").unwrap_or_else(|_| "./data".into());
    tokio::fs::create_dir_all(&data_dir).await?;
    let store = BlockStore::new(Arc::new(LocalStore::new(&data_dir)));
    info!(data_dir, "starting tracedb");

    // Ring + ingester replicas.
    let ring = Ring::default();
    let replica_count = config.distributor.replication_factor.max(1);
    let mut ingesters = Vec::new();
    for i in 0..replica_count {
        let id = format!("ingester-{}", i);
        ring.join(id.clone());
        ingesters.push(Arc::new(Ingester::new(
            id,
            config.ingester.clone(),
            config.block.clone(),
            store.clone(),
        )));
    }

    let handles: Vec<Arc<dyn IngesterHandle>> = ingesters
        .iter()
        .map(|i| i.clone() as Arc<dyn IngesterHandle>)
        .collect();

    let _distributor = Arc::new(Distributor::new(
        config.distributor.clone(),
        ring.clone(),
        handles.clone(),
    ));

    let querier_count = num_cpus::get().min(4).max(1);
    let queriers: Vec<Arc<Querier>> = (0..querier_count)
        .map(|_| {
            Arc::new(Querier::new(
                ring.clone(),
                config.distributor.replication_factor,
                handles.clone(),
                store.clone(),
            ))
        })
        .collect();
    let _frontend = Arc::new(QueryFrontend::new(config.query.clone(), queriers));

    // Background loops.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    for ingester in &ingesters {
        tasks.push(tokio::spawn(ingester.clone().run(shutdown_rx.clone())));
    }
    let compactor = Arc::new(Compactor::new(
        config.compactor.clone(),
        config.block.clone(),
        store.clone(),
    ));
    tasks.push(tokio::spawn(compactor.run(shutdown_rx.clone())));

    info!(
        replicas = replica_count,
        queriers = querier_count,
        "tracedb ready; ingestion and query surfaces are wired in-process"
    );

    signal::ctrl_c().await?;
    info!("shutting down, draining ingesters");
    shutdown_tx.send(true)?;
    for task in tasks {
        let _ = task.await;
    }
    info!("shutdown complete");
    Ok(())
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::var("TRACEDB_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        Err(_) => Ok(Config::default()),
    }
}
