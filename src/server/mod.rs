// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{filter::EnvFilter, reload};

mod connection_loop;
mod initialization;
mod metrics_server;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    // 1. Initialize the pool module, start the resident pool services, and
    //    bind the listener.
    let context = initialization::setup(config, log_reload_handle).await?;

    // 2. Start the main connection acceptance loop. This runs until shutdown
    //    and tears the module down on its way out.
    connection_loop::run(context).await;

    Ok(())
}
