// src/core/svc/disconnect.rs

//! DISCONNECT and EVICT: the shared handle-close pipeline, the single-handle
//! RPC, and the evict-everyone RPC.

use super::{PoolModule, PoolSvc};
use crate::core::PoolError;
use crate::core::layout;
use crate::core::metrics;
use crate::core::rdb::RdbTx;
use tracing::{debug, error};
use uuid::Uuid;

/// Closes a batch of handles inside the caller's transaction: containers
/// first, then the target fan-out, then the metadata. The caller commits.
pub(crate) async fn disconnect_handles(
    tx: &mut RdbTx,
    svc: &PoolSvc,
    handles: &[Uuid],
) -> Result<(), PoolError> {
    debug_assert!(!handles.is_empty());
    debug!(
        pool = %svc.uuid(),
        n = handles.len(),
        first = %handles[0],
        "disconnecting handles"
    );

    svc.fabric()
        .containers
        .close_by_pool_handles(svc.uuid(), handles)
        .await?;

    svc.fabric()
        .targets
        .tgt_disconnect(svc.uuid(), handles)
        .await
        .map_err(|e| {
            error!(pool = %svc.uuid(), error = %e, "failed to disconnect from targets");
            e
        })?;

    let nhandles = layout::read_nhandles(tx, svc.root())?;
    for handle in handles {
        tx.delete(svc.handles_path(), handle.as_bytes());
    }
    layout::write_nhandles(tx, svc.root(), nhandles.saturating_sub(handles.len() as u32));
    Ok(())
}

/// The DISCONNECT handler. Disconnecting a handle the metadata does not know
/// succeeds silently; the client is already in the desired state.
pub async fn pool_disconnect(
    module: &PoolModule,
    pool: Uuid,
    handle: Uuid,
) -> Result<(), PoolError> {
    debug!(%pool, %handle, "processing disconnect");

    let guard = module.registry.lookup_leader(pool).await?;
    let svc = guard.svc();

    let term = svc.term().await;
    let mut tx = svc.rdb().tx_begin(term);
    let _guard = svc.ps_lock.write().await;

    match tx.lookup(svc.handles_path(), handle.as_bytes()) {
        Ok(_) => {}
        Err(PoolError::Nonexist) => {
            tx.end();
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    disconnect_handles(&mut tx, svc, &[handle]).await?;
    tx.commit().await?;

    metrics::OPEN_HANDLES.dec();
    Ok(())
}

/// The EVICT handler: enumerates every open handle and runs the whole batch
/// through the disconnect pipeline in a single transaction.
pub async fn pool_evict(module: &PoolModule, pool: Uuid) -> Result<(), PoolError> {
    debug!(%pool, "processing evict");

    let guard = module.registry.lookup_leader(pool).await?;
    let svc = guard.svc();

    let term = svc.term().await;
    let mut tx = svc.rdb().tx_begin(term);
    let _guard = svc.ps_lock.write().await;

    let handles = find_handles_to_evict(&tx, svc)?;
    if !handles.is_empty() {
        disconnect_handles(&mut tx, svc, &handles).await?;
    }
    let evicted = handles.len();
    tx.commit().await?;

    metrics::OPEN_HANDLES.sub(evicted as f64);
    Ok(())
}

/// Collects every handle UUID in the handles KVS. The array starts small and
/// doubles as the iteration outgrows it; each entry is a fixed 16 bytes, so
/// the growth is bounded by the handle count.
fn find_handles_to_evict(tx: &RdbTx, svc: &PoolSvc) -> Result<Vec<Uuid>, PoolError> {
    let mut handles: Vec<Uuid> = Vec::with_capacity(4);
    tx.iterate(svc.handles_path(), |key, value| {
        if key.len() != 16 || value.len() != 8 {
            error!(
                key_len = key.len(),
                value_len = value.len(),
                "invalid handle entry"
            );
            return Err(PoolError::Io(std::sync::Arc::new(std::io::Error::other(
                "corrupt handle entry",
            ))));
        }
        if handles.len() == handles.capacity() {
            handles.reserve(handles.capacity());
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(key);
        handles.push(Uuid::from_bytes(bytes));
        Ok(())
    })?;
    Ok(handles)
}
