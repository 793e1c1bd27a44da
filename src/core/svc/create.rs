// src/core/svc/create.rs

//! CREATE: initializes the full pool metadata schema, and the driver that
//! creates a pool service across replicas.

use super::{PoolModule, SvcState};
use crate::core::PoolError;
use crate::core::bootstrap;
use crate::core::client::{ReplicaTransport, RsvcClient};
use crate::core::layout;
use crate::core::pool_map::Rank;
use crate::core::protocol::{PoolRequest, PoolReply};
use crate::core::rdb::NIL_TERM;
use tracing::{debug, error};
use uuid::Uuid;

/// Inputs of the CREATE RPC.
#[derive(Debug, Clone)]
pub struct CreateArgs {
    pub pool: Uuid,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub target_uuids: Vec<Uuid>,
    pub target_ranks: Vec<Rank>,
    pub domains: Vec<u32>,
}

/// The CREATE handler. Initializes the DB and the pool metadata in one
/// transaction; a DB that already carries a map buffer makes the whole RPC a
/// successful no-op, which is what makes CREATE idempotent. On success in the
/// `UpEmpty` state the service finishes stepping up.
///
/// This RPC does not require the service to be up: it is what takes a fresh
/// service from `UpEmpty` to `Up`.
pub async fn pool_create(module: &PoolModule, args: CreateArgs) -> Result<(), PoolError> {
    debug!(pool = %args.pool, "processing create");

    if args.target_uuids.len() != args.target_ranks.len() {
        return Err(PoolError::Proto(format!(
            "{} target uuids vs {} ranks",
            args.target_uuids.len(),
            args.target_ranks.len()
        )));
    }
    let children: u32 = args.domains.iter().sum();
    if args.domains.is_empty() || children as usize != args.target_uuids.len() {
        return Err(PoolError::Proto(format!(
            "domain vector accounts for {children} nodes, got {}",
            args.target_uuids.len()
        )));
    }

    let svc = module.registry.lookup(args.pool)?;

    // Serialize the whole RPC with step-up/step-down and stop.
    let mut lc = svc.mu.lock().await;
    if lc.stop {
        debug!(pool = %args.pool, "pool service already stopping");
        return Err(PoolError::Canceled);
    }

    {
        let mut tx = svc.rdb().tx_begin(NIL_TERM);
        let _guard = svc.ps_lock.write().await;

        // See if the DB has already been initialized.
        match tx.lookup(svc.root(), layout::ATTR_MAP_BUFFER) {
            Ok(_) => {
                debug!(pool = %args.pool, "db already initialized");
                tx.end();
                return Ok(());
            }
            Err(PoolError::Nonexist) | Err(PoolError::Uninit) => {}
            Err(e) => {
                error!(pool = %args.pool, error = %e, "failed to look up pool map");
                return Err(e);
            }
        }

        tx.create_root(layout::ROOT_KVS_ATTR);
        layout::init_pool_metadata(
            &mut tx,
            svc.root(),
            args.uid,
            args.gid,
            args.mode,
            &args.target_uuids,
            &args.target_ranks,
            &args.domains,
            svc.config().streams_per_node,
        )?;
        svc.fabric()
            .containers
            .init_metadata(&mut tx, svc.root(), args.pool)?;
        tx.commit().await?;
    }

    if lc.state == SvcState::UpEmpty {
        // The DB is no longer empty. The step-up callback of this term could
        // not finish because of the empty DB and no step-down has happened
        // since, so finish stepping up here.
        debug!(pool = %args.pool, "trying to finish stepping up");
        let term = lc.term;
        svc.step_up(term).await.map_err(|e| {
            debug_assert_ne!(e, PoolError::Uninit);
            e
        })?;
        lc.state = SvcState::Up;
        svc.state_cv.notify_waiters();
    }

    Ok(())
}

/// Selects the service replica ranks out of the pool's target ranks.
///
/// `nreplicas` inputs how many replicas are wanted; the returned list may be
/// shorter when fewer targets qualify. Rank 0 is skipped unless it is the
/// only candidate. When the domain vector is usable, candidates are drawn
/// round-robin across domains so replicas spread over fault domains; a
/// missing or inconsistent vector falls back to plain input order.
pub fn select_svc_ranks(
    nreplicas: usize,
    target_ranks: &[Rank],
    domains: &[u32],
) -> Result<Vec<Rank>, PoolError> {
    if nreplicas == 0 {
        return Err(PoolError::Inval("zero replicas requested".into()));
    }

    let has_rank_zero = target_ranks.contains(&0);
    let selectable = if has_rank_zero && target_ranks.len() > 1 {
        target_ranks.len() - 1
    } else {
        target_ranks.len()
    };
    let wanted = nreplicas.min(selectable);

    let skip_zero = has_rank_zero && target_ranks.len() > 1;
    let eligible = |rank: Rank| !(skip_zero && rank == 0);

    let children: u32 = domains.iter().sum();
    let spread = !domains.is_empty() && children as usize == target_ranks.len();

    let mut ranks = Vec::with_capacity(wanted);
    if spread {
        // Partition ranks into their domains by the consecutive child
        // counts, then take one from each domain per round.
        let mut groups: Vec<&[Rank]> = Vec::with_capacity(domains.len());
        let mut offset = 0usize;
        for nr in domains {
            let end = offset + *nr as usize;
            groups.push(&target_ranks[offset..end]);
            offset = end;
        }
        let mut depth = 0usize;
        while ranks.len() < wanted {
            let mut advanced = false;
            for group in &groups {
                if ranks.len() == wanted {
                    break;
                }
                if let Some(rank) = group.get(depth).copied().filter(|r| eligible(*r)) {
                    ranks.push(rank);
                    advanced = true;
                } else if group.len() > depth {
                    advanced = true;
                }
            }
            if !advanced {
                break;
            }
            depth += 1;
        }
    } else {
        for rank in target_ranks {
            if ranks.len() == wanted {
                break;
            }
            if eligible(*rank) {
                ranks.push(*rank);
            }
        }
    }

    Ok(ranks)
}

/// Creates a pool service: selects the replica ranks, starts a fresh
/// replicated DB on them (bootstrapping the membership), and drives the
/// CREATE RPC through the rechoose client until a leader commits the initial
/// metadata. Returns the selected replica ranks.
#[allow(clippy::too_many_arguments)]
pub async fn svc_create(
    module: &PoolModule,
    transport: &dyn ReplicaTransport,
    pool: Uuid,
    uid: u32,
    gid: u32,
    mode: u32,
    target_uuids: Vec<Uuid>,
    target_ranks: Vec<Rank>,
    domains: Vec<u32>,
    nreplicas: usize,
) -> Result<Vec<Rank>, PoolError> {
    debug_assert_eq!(target_uuids.len(), target_ranks.len());

    let ranks = select_svc_ranks(nreplicas, &target_ranks, &domains)?;
    let db_uuid = Uuid::new_v4();

    module
        .fabric
        .rdb_dist
        .dist_start(
            db_uuid,
            pool,
            &ranks,
            true, /* create */
            true, /* bootstrap */
            bootstrap::md_cap(),
        )
        .await?;

    let request = PoolRequest::Create {
        pool: pool.into(),
        uid,
        gid,
        mode,
        target_uuids: target_uuids.iter().copied().map(Into::into).collect(),
        target_ranks,
        domains,
    };

    let client = RsvcClient::new(ranks.clone(), module.config.rechoose_backoff);
    let result = client.send(transport, request).await;
    match result {
        Ok(PoolReply::Create { op }) if op.rc.is_ok() => {
            debug!(%pool, ?ranks, "pool service created");
            Ok(ranks)
        }
        Ok(reply) => {
            let e = reply.to_error();
            error!(%pool, error = %e, "failed to create pool");
            let _ = module
                .fabric
                .rdb_dist
                .dist_stop(pool, Some(&ranks), true /* destroy */)
                .await;
            Err(e)
        }
        Err(e) => {
            error!(%pool, error = %e, "failed to create pool");
            let _ = module
                .fabric
                .rdb_dist
                .dist_stop(pool, Some(&ranks), true /* destroy */)
                .await;
            Err(e)
        }
    }
}
