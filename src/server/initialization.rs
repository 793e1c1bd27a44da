// src/server/initialization.rs

//! Builds the process-wide pool module, starts every resident pool service,
//! and binds the listeners.

use crate::config::Config;
use crate::core::fabric::LocalFabric;
use crate::core::svc::{PoolModule, lifecycle};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Everything the accept loop needs.
pub struct ServerContext {
    pub module: Arc<PoolModule>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    #[allow(dead_code)]
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
}

pub async fn setup(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    let config = Arc::new(config);

    // The single-node deployment wires the in-process fabric; a clustered
    // deployment substitutes its transport-backed collaborators here.
    let fabric = LocalFabric::new(config.self_rank).fabric;
    let module = PoolModule::init(Arc::clone(&config), fabric.clone());

    // Scan the storage root and bring every resident pool service up.
    lifecycle::start_all(&module.registry, fabric, Arc::clone(&config))
        .await
        .context("failed to start resident pool services")?;
    info!(
        pools = module.registry.all().len(),
        storage = %config.storage_path.display(),
        "pool services started"
    );

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr}");

    let (shutdown_tx, _) = broadcast::channel(1);

    if config.metrics.enabled {
        tokio::spawn(super::metrics_server::run_metrics_server(
            config.metrics.port,
            shutdown_tx.subscribe(),
        ));
    }

    Ok(ServerContext {
        module,
        listener,
        shutdown_tx,
        log_reload_handle,
    })
}
