// src/core/svc/query.rs

//! QUERY: returns the pool attributes, the rebuild status, and the pool map.

use super::PoolModule;
use crate::core::PoolError;
use crate::core::broadcast;
use crate::core::bulk::RemoteBulk;
use crate::core::handles::REBUILD_HANDLE;
use crate::core::layout;
use crate::core::rebuild::RebuildStatus;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Outputs of the QUERY RPC.
#[derive(Debug, Clone, Copy)]
pub struct QueryOut {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rebuild: RebuildStatus,
}

/// The QUERY handler. The caller's handle is verified unless the caller is
/// the rebuild subsystem, which queries pools without connecting to them.
pub async fn pool_query(
    module: &PoolModule,
    pool: Uuid,
    handle: Uuid,
    map_bulk: Arc<dyn RemoteBulk>,
) -> Result<QueryOut, PoolError> {
    debug!(%pool, %handle, "processing query");

    let guard = module.registry.lookup_leader(pool).await?;
    let svc = guard.svc();

    let rebuild = svc.fabric().rebuild.query(pool).await?;

    let term = svc.term().await;
    let tx = svc.rdb().tx_begin(term);
    let _guard = svc.ps_lock.read().await;

    if handle != REBUILD_HANDLE {
        match tx.lookup(svc.handles_path(), handle.as_bytes()) {
            Ok(_) => {}
            Err(PoolError::Nonexist) => return Err(PoolError::NoHandle),
            Err(e) => return Err(e),
        }
    }

    let attrs = layout::read_attrs(&tx, svc.root())?;

    let (map_buf, map_version) = layout::read_map_buf(&tx, svc.root())?;
    let cached_version = svc.cached_version().await;
    if map_version != cached_version {
        error!(
            %pool,
            cached = cached_version,
            persistent = map_version,
            "cached and persistent pool map versions differ"
        );
        return Err(PoolError::Io(Arc::new(std::io::Error::other(
            "pool map cache out of sync",
        ))));
    }
    broadcast::transfer_map(&map_buf, map_bulk.as_ref()).await?;

    Ok(QueryOut {
        uid: attrs.uid,
        gid: attrs.gid,
        mode: attrs.mode,
        rebuild,
    })
}

/// Fetches the committed map buffer for an in-process consumer (the rebuild
/// subsystem redistributes maps itself).
pub async fn pool_map_buf_get(
    module: &PoolModule,
    pool: Uuid,
) -> Result<(bytes::Bytes, u32), PoolError> {
    let guard = module.registry.lookup_leader(pool).await?;
    let svc = guard.svc();

    let term = svc.term().await;
    let tx = svc.rdb().tx_begin(term);
    let _guard = svc.ps_lock.read().await;

    let (map_buf, version) = layout::read_map_buf(&tx, svc.root()).map_err(|e| {
        error!(%pool, error = %e, "failed to read pool map");
        e
    })?;
    Ok((map_buf.encode(), version))
}

/// The service term for in-process consumers.
pub async fn pool_svc_term_get(module: &PoolModule, pool: Uuid) -> Result<u64, PoolError> {
    let guard = module.registry.lookup_leader(pool).await?;
    Ok(guard.term().await)
}
