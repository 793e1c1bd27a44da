// src/core/svc/connect.rs

//! CONNECT: admits a new pool handle, transfers the pool map to the client,
//! and announces the handle to every target server.

use super::PoolModule;
use crate::core::PoolError;
use crate::core::broadcast;
use crate::core::bulk::RemoteBulk;
use crate::core::fabric::TgtConnectReq;
use crate::core::handles::{PoolCaps, PoolHandle, permitted};
use crate::core::layout;
use crate::core::metrics;
use crate::core::rebuild::RebuildStatus;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Inputs of the CONNECT RPC.
pub struct ConnectArgs {
    pub pool: Uuid,
    pub handle: Uuid,
    pub uid: u32,
    pub gid: u32,
    pub capas: PoolCaps,
    /// The client buffer receiving the pool map.
    pub map_bulk: Arc<dyn RemoteBulk>,
}

/// Outputs of the CONNECT RPC.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOut {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rebuild: RebuildStatus,
}

/// The CONNECT handler.
///
/// The map transfer happens before the handle is inserted so a transfer
/// failure needs no transaction rollback; the target broadcast happens before
/// commit so a broadcast failure aborts the whole admission. The reverse
/// window — broadcast delivered, commit failed — leaves targets holding a
/// handle the metadata never admitted; eviction reconciles those.
pub async fn pool_connect(
    module: &PoolModule,
    args: ConnectArgs,
) -> Result<ConnectOut, PoolError> {
    debug!(pool = %args.pool, handle = %args.handle, "processing connect");

    let guard = module.registry.lookup_leader(args.pool).await?;
    let svc = guard.svc();

    // The namespace lives for as long as the pool does; target servers
    // attach to it with the descriptor we broadcast below.
    let iv_ns = svc.ensure_iv_ns().await?;
    let iv_ctx = iv_ns.global_ctx();

    let rebuild = svc.fabric().rebuild.query(args.pool).await?;

    let term = svc.term().await;
    let mut tx = svc.rdb().tx_begin(term);
    let _guard = svc.ps_lock.write().await;

    // Check existing pool handles.
    let mut skip_update = false;
    match tx.lookup(svc.handles_path(), args.handle.as_bytes()) {
        Ok(value) => {
            let existing = PoolHandle::decode(&value)?;
            if existing.capas == args.capas {
                // The handle already exists; only do the pool map transfer.
                skip_update = true;
            } else {
                error!(pool = %args.pool, handle = %args.handle, "conflicting pool handle");
                return Err(PoolError::Exist);
            }
        }
        Err(PoolError::Nonexist) => {}
        Err(e) => return Err(e),
    }

    let attrs = layout::read_attrs(&tx, svc.root())?;
    if !permitted(&attrs, args.uid, args.gid, args.capas) {
        warn!(
            pool = %args.pool,
            uid = args.uid,
            gid = args.gid,
            capas = args.capas.bits(),
            "refusing connect attempt"
        );
        return Err(PoolError::NoPerm);
    }

    let out = ConnectOut {
        uid: attrs.uid,
        gid: attrs.gid,
        mode: attrs.mode,
        rebuild,
    };

    // Transfer the pool map before admitting the handle, so a failed or
    // truncated transfer never needs a rollback.
    let (map_buf, map_version) = layout::read_map_buf(&tx, svc.root())?;
    let cached_version = svc.cached_version().await;
    if map_version != cached_version {
        error!(
            pool = %args.pool,
            cached = cached_version,
            persistent = map_version,
            "cached and persistent pool map versions differ"
        );
        return Err(PoolError::Io(Arc::new(std::io::Error::other(
            "pool map cache out of sync",
        ))));
    }
    broadcast::transfer_map(&map_buf, args.map_bulk.as_ref()).await?;

    if skip_update {
        return Ok(out);
    }

    let nhandles = layout::read_nhandles(&tx, svc.root())?;

    // Take care of exclusive handles.
    if nhandles != 0 {
        if args.capas.contains(PoolCaps::EX) {
            debug!(pool = %args.pool, "others already connected");
            return Err(PoolError::Busy);
        }
        // If there is a non-exclusive handle, then all handles are
        // non-exclusive.
        let (_, first) = tx.probe_first(svc.handles_path())?;
        if PoolHandle::decode(&first)?.is_exclusive() {
            return Err(PoolError::Busy);
        }
    }

    svc.fabric()
        .targets
        .tgt_connect(TgtConnectReq {
            pool: args.pool,
            handle: args.handle,
            capas: args.capas.bits(),
            map_version,
            iv_ns_id: iv_ns.id(),
            iv_ctx,
            master_rank: svc.fabric().self_rank,
        })
        .await
        .map_err(|e| {
            error!(pool = %args.pool, error = %e, "failed to connect to targets");
            e
        })?;

    layout::write_nhandles(&mut tx, svc.root(), nhandles + 1);
    tx.update(
        svc.handles_path(),
        args.handle.as_bytes(),
        PoolHandle { capas: args.capas }.encode(),
    );
    tx.commit().await?;

    metrics::OPEN_HANDLES.inc();
    Ok(out)
}
