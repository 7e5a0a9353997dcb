//! # Pipeline Orchestrator Demo
//!
//! Opens one connection against the in-memory backend and walks it through
//! its lifecycle:
//! 1. Activate `svc:K1, log:K1, auth:K2`.
//! 2. Push data through the assembled pipeline.
//! 3. Modify to `log:K1, auth:K2, audit:K3`.
//! 4. Close and shut down.
//!
//! An optional first argument names a TOML configuration file.

use pipeline_orchestrator::backend::{Backend, TagFactory};
use pipeline_orchestrator::config::OrchestratorConfig;
use pipeline_orchestrator::lifecycle::{setup_tracing, SessionManager};
use pipeline_orchestrator::model::DesiredSet;
use pipeline_orchestrator::supply::SupplyChannel;
use std::sync::Arc;
use tracing::{error, info, Instrument};

#[tokio::main]
async fn main() -> Result<(), String> {
    setup_tracing();

    let config = match std::env::args().nth(1) {
        Some(path) => OrchestratorConfig::from_file(&path).map_err(|e| e.to_string())?,
        None => OrchestratorConfig::default(),
    };
    info!(app = %config.app_name, "Starting pipeline orchestrator demo");

    let supply = SupplyChannel::new();
    let backend = Backend::start(supply.clone(), config.command_buffer);
    for kind in ["K1", "K2", "K3"] {
        backend.factories.register(kind, TagFactory);
    }

    let manager = SessionManager::new(config, Arc::new(backend.client.clone()), supply)
        .map_err(|e| e.to_string())?;

    let desired = DesiredSet::from_pairs([("svc", "K1"), ("log", "K1"), ("auth", "K2")])
        .map_err(|e| e.to_string())?;

    let span = tracing::info_span!("activation");
    let (id, ready) = async {
        info!("Opening connection");
        manager.open(desired).await.map_err(|e| e.to_string())
    }
    .instrument(span)
    .await?;
    info!(connection = %id, generation = ready.generation, "Connection ready");

    let connection = manager
        .connection(&id)
        .await
        .ok_or_else(|| format!("connection {id} vanished"))?;
    let names = connection.names().await.map_err(|e| e.to_string())?;
    info!(stages = ?names, "Pipeline assembled");

    connection.deliver("hello").await.map_err(|e| e.to_string())?;

    let next = DesiredSet::from_pairs([("log", "K1"), ("auth", "K2"), ("audit", "K3")])
        .map_err(|e| e.to_string())?;
    let span = tracing::info_span!("modification");
    let modified = async {
        info!("Modifying desired set");
        manager.modify(&id, next).await
    }
    .instrument(span)
    .await;
    match modified {
        Ok(()) => {
            let names = connection.names().await.map_err(|e| e.to_string())?;
            info!(stages = ?names, "Pipeline reassembled");
        }
        Err(e) => error!(error = %e, "Modify failed"),
    }

    connection.deliver("world").await.map_err(|e| e.to_string())?;
    let delivered = connection.delivered().await.map_err(|e| e.to_string())?;
    info!(?delivered, "Data delivered to tail");

    manager.close(&id).await.map_err(|e| e.to_string())?;
    manager.shutdown().await?;

    let leftover = backend.client.list().await.map_err(|e| e.to_string())?;
    info!(records = leftover.len(), "Records left in backend");
    backend.shutdown().await?;

    info!("Demo completed successfully");
    Ok(())
}
