// src/core/svc/update.rs

//! UPDATE: membership changes. Addresses are resolved against the committed
//! map, the opcode is applied, and on commit the cached map is swapped, the
//! new map is broadcast, and (for exclusions) a rebuild is scheduled.

use super::PoolModule;
use crate::core::PoolError;
use crate::core::broadcast;
use crate::core::layout;
use crate::core::metrics;
use crate::core::pool_map::{Rank, TargetId, UpdateOp};
use crate::core::rebuild;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// One target address: a rank plus the target index on that rank.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TargetAddr {
    pub rank: Rank,
    pub index: u32,
}

/// Outputs of the UPDATE RPC.
#[derive(Debug, Clone)]
pub struct UpdateOut {
    /// Addresses that named nothing in the map, returned verbatim.
    pub failed: Vec<TargetAddr>,
    pub map_version: u32,
}

/// Resolves target addresses against the committed map. Addresses with no
/// match land in the failed list; the membership change still applies to the
/// resolved ids.
async fn find_targets_by_addr(
    module: &PoolModule,
    pool: Uuid,
    addrs: &[TargetAddr],
) -> Result<(Vec<TargetId>, Vec<TargetAddr>), PoolError> {
    let guard = module.registry.lookup_leader(pool).await?;
    let svc = guard.svc();

    let map = {
        let term = svc.term().await;
        let tx = svc.rdb().tx_begin(term);
        let _guard = svc.ps_lock.read().await;
        layout::read_map(&tx, svc.root())?
    };

    let mut ids = Vec::new();
    let mut failed = Vec::new();
    for addr in addrs {
        let targets = map.find_targets(addr.rank, addr.index);
        if targets.is_empty() {
            failed.push(*addr);
            continue;
        }
        for target in targets {
            ids.push(target.id());
        }
    }
    Ok((ids, failed))
}

/// Applies `op` to the given target ids: read the committed map, mutate,
/// write back, commit, swap the cache, broadcast.
///
/// Returns the resulting map version, whether anything changed, and the
/// replica ranks captured at commit time (for rebuild scheduling).
pub(crate) async fn update_targets(
    module: &PoolModule,
    pool: Uuid,
    ids: &[TargetId],
    op: UpdateOp,
) -> Result<(u32, bool, Vec<Rank>), PoolError> {
    let guard = module.registry.lookup_leader(pool).await?;
    let svc = guard.svc();

    let term = svc.term().await;
    let mut tx = svc.rdb().tx_begin(term);
    let _guard = svc.ps_lock.write().await;

    let replicas = svc.rdb().get_ranks();

    // A temporary pool map based on the last committed version.
    let mut map = layout::read_map(&tx, svc.root())?;
    let version_before = map.version();
    let version = map.apply_update(ids, op);
    debug!(%pool, %op, from = version_before, to = version, "membership update");
    if version == version_before {
        tx.end();
        return Ok((version, false, replicas));
    }

    let map_buf = map.extract_buf();
    layout::write_map_buf(&mut tx, svc.root(), &map_buf, version)?;
    tx.commit().await?;

    // The new pool map is committed and can be publicized: swap the cache.
    let map = Arc::new(map);
    *svc.cache.write().await = Some(Arc::clone(&map));
    metrics::MAP_VERSION.set(i64::from(version));

    // Distribute the new map. Committing the change matters more than its
    // dissemination, so a broadcast failure is logged, not returned. No
    // namespace means no client ever connected and nobody to notify.
    if let Some(ns) = svc.iv_ns().await {
        if let Err(e) =
            broadcast::broadcast_map(&ns, svc.fabric().self_rank, pool, version, &map_buf).await
        {
            warn!(%pool, version, error = %e, "failed to broadcast pool map");
        }
    }

    Ok((version, true, replicas))
}

/// The UPDATE handler.
pub async fn pool_update(
    module: &PoolModule,
    pool: Uuid,
    addrs: Vec<TargetAddr>,
    op: UpdateOp,
) -> Result<UpdateOut, PoolError> {
    if addrs.is_empty() {
        return Err(PoolError::Inval("empty target address list".into()));
    }
    debug!(%pool, ntargets = addrs.len(), %op, "processing update");

    let (ids, failed) = find_targets_by_addr(module, pool, &addrs).await?;
    let (map_version, updated, replicas) = update_targets(module, pool, &ids, op).await?;

    // Rebuild runs over the replica set captured at the moment of commit.
    // Scheduling failures are surfaced: the reply has not been sent yet.
    if updated && op == UpdateOp::Exclude {
        if rebuild::rebuild_disabled() {
            debug!(%pool, "rebuild is disabled");
        } else if let Err(e) = module
            .fabric
            .rebuild
            .schedule(pool, map_version, &ids, &replicas)
            .await
        {
            error!(%pool, error = %e, "failed to schedule rebuild");
            return Err(e);
        }
    }

    Ok(UpdateOut {
        failed,
        map_version,
    })
}

/// Excludes targets by id on behalf of in-process callers (the rebuild
/// subsystem excludes targets that fail mid-rebuild).
pub async fn pool_tgt_exclude(
    module: &PoolModule,
    pool: Uuid,
    ids: &[TargetId],
) -> Result<(), PoolError> {
    update_targets(module, pool, ids, UpdateOp::Exclude).await?;
    Ok(())
}

/// Marks targets fully drained on behalf of in-process callers.
pub async fn pool_tgt_exclude_out(
    module: &PoolModule,
    pool: Uuid,
    ids: &[TargetId],
) -> Result<(), PoolError> {
    update_targets(module, pool, ids, UpdateOp::ExcludeOut).await?;
    Ok(())
}
