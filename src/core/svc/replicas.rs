// src/core/svc/replicas.rs

//! REPLICAS_ADD / REPLICAS_REMOVE: membership changes of the replicated DB
//! itself, plus the STOP RPC.

use super::PoolModule;
use crate::core::PoolError;
use crate::core::bootstrap;
use crate::core::pool_map::Rank;
use crate::core::svc::lifecycle;
use tracing::{debug, error};
use uuid::Uuid;

/// The REPLICAS_ADD handler: starts fresh (non-bootstrap) DB replicas on the
/// given ranks and adds them to the log membership. Returns the ranks that
/// failed — on error the whole input, since the change is all-or-nothing.
pub async fn pool_replicas_add(
    module: &PoolModule,
    pool: Uuid,
    ranks: Vec<Rank>,
) -> Result<Vec<Rank>, PoolError> {
    debug!(%pool, ?ranks, "processing replicas add");

    // Look the leader up locally and release the reference immediately:
    // holding it across the membership change could deadlock a removal of
    // the leader replica itself, which cannot stop until all references are
    // gone.
    let db = {
        let guard = module.registry.lookup_leader(pool).await?;
        guard.rdb().clone()
    };
    let db_uuid = db.uuid();

    let result = async {
        module
            .fabric
            .rdb_dist
            .dist_start(
                db_uuid,
                pool,
                &ranks,
                true,  /* create */
                false, /* bootstrap */
                bootstrap::md_cap(),
            )
            .await?;
        db.add_replicas(&ranks)
    }
    .await;

    match result {
        Ok(()) => Ok(Vec::new()),
        Err(e) => {
            error!(%pool, error = %e, "failed to add replicas");
            Err(e)
        }
    }
}

/// The REPLICAS_REMOVE handler: removes the ranks from the log membership,
/// then asks for their DB files to be destroyed (best effort).
pub async fn pool_replicas_remove(
    module: &PoolModule,
    pool: Uuid,
    ranks: Vec<Rank>,
) -> Result<Vec<Rank>, PoolError> {
    debug!(%pool, ?ranks, "processing replicas remove");

    let db = {
        let guard = module.registry.lookup_leader(pool).await?;
        guard.rdb().clone()
    };

    db.remove_replicas(&ranks).map_err(|e| {
        error!(%pool, error = %e, "failed to remove replicas");
        e
    })?;

    // The membership change is committed; destruction of the removed
    // replicas' files is best effort.
    let _ = module
        .fabric
        .rdb_dist
        .dist_stop(pool, Some(&ranks), true /* destroy */)
        .await;

    Ok(Vec::new())
}

/// The STOP handler. Non-leader replicas refuse with a hint so the caller
/// finds the leader.
pub async fn pool_svc_stop_handler(module: &PoolModule, pool: Uuid) -> Result<(), PoolError> {
    debug!(%pool, "processing stop");

    let svc = module.registry.lookup(pool)?;
    let lc = svc.mu.lock().await;
    let up = !lc.stop && lc.state == super::SvcState::Up;
    drop(lc);
    if !up {
        return Err(PoolError::NotLeader {
            hint: svc.rdb().leader_hint(),
        });
    }

    lifecycle::stop(&module.registry, pool).await;
    Ok(())
}
