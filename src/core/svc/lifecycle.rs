// src/core/svc/lifecycle.rs

//! The service lifecycle: step-up and step-down driven by the replicated
//! DB's callbacks, explicit stop, and the process-wide start-all/stop-all
//! fan-out.

use super::{PoolSvc, SvcState};
use crate::config::Config;
use crate::core::PoolError;
use crate::core::fabric::Fabric;
use crate::core::layout;
use crate::core::metrics;
use crate::core::rdb::{Rdb, RdbCallbacks, Term};
use crate::core::bootstrap;
use crate::core::registry::Registry;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

impl PoolSvc {
    /// The leader work of stepping up: load the committed map, create the
    /// pool group, publish the cache, and resume interrupted rebuilds.
    /// Returns `Uninit` when the DB holds no pool metadata yet.
    pub(crate) async fn step_up(&self, term: Term) -> Result<(), PoolError> {
        debug!(pool = %self.uuid(), term, "stepping up");

        let (map, replicas) = {
            let tx = self.rdb().tx_begin(term);
            let _guard = self.ps_lock.read().await;
            let map = layout::read_map(&tx, self.root())?;
            let replicas = self.rdb().get_ranks();
            tx.end();
            (map, replicas)
        };
        let map_version = map.version();

        self.fabric().targets.ensure_group(self.uuid(), &map).await?;

        let map = Arc::new(map);
        *self.cache.write().await = Some(Arc::clone(&map));

        self.fabric().containers.step_up(self.uuid());

        if let Err(e) = self
            .fabric()
            .rebuild
            .regenerate(self.uuid(), &replicas)
            .await
        {
            self.fabric().containers.step_down(self.uuid());
            *self.cache.write().await = None;
            return Err(e);
        }

        metrics::STEP_UPS_TOTAL.inc();
        info!(
            pool = %self.uuid(),
            rank = self.fabric().self_rank,
            term,
            map_version,
            "became pool service leader"
        );
        Ok(())
    }

    /// The leader work of stepping down: stop leader-side rebuild tasks,
    /// drain leader references, and drop the leader-only cache.
    pub(crate) async fn step_down(&self, term: Term) {
        debug!(pool = %self.uuid(), term, "stepping down");

        self.fabric().rebuild.leader_stop(self.uuid());

        // Wait for in-flight handlers to release their leader references.
        // The final release stores a permit, so a wakeup between the load
        // and the await is not lost.
        loop {
            let refs = self.leader_refs.load(Ordering::SeqCst);
            if refs == 0 {
                break;
            }
            debug!(pool = %self.uuid(), refs, "waiting for leader references");
            self.leader_cv.notified().await;
        }

        self.fabric().containers.step_down(self.uuid());
        *self.cache.write().await = None;

        metrics::STEP_DOWNS_TOTAL.inc();
        info!(
            pool = %self.uuid(),
            rank = self.fabric().self_rank,
            term,
            "no longer pool service leader"
        );
    }

    /// Step-up callback from the replicated DB.
    pub(crate) async fn step_up_cb(&self, term: Term) -> Result<(), PoolError> {
        let mut lc = self.mu.lock().await;
        if lc.stop {
            debug!(pool = %self.uuid(), term, "skipping step-up while stopping");
            return Ok(());
        }
        debug_assert_eq!(lc.state, SvcState::Down);
        lc.term = term;

        match self.step_up(term).await {
            Ok(()) => {
                lc.state = SvcState::Up;
            }
            Err(PoolError::Uninit) => {
                debug!(pool = %self.uuid(), term, "new db");
                lc.state = SvcState::UpEmpty;
            }
            Err(e) => {
                error!(pool = %self.uuid(), term, error = %e, "failed to step up");
                return Err(e);
            }
        }
        self.state_cv.notify_waiters();
        Ok(())
    }

    /// Step-down callback from the replicated DB.
    pub(crate) async fn step_down_cb(&self, term: Term) {
        let mut lc = self.mu.lock().await;
        debug_assert_eq!(lc.term, term);
        debug_assert_ne!(lc.state, SvcState::Down);

        if lc.state == SvcState::Up {
            // Draining refuses new leader references; the mutex is released
            // while in-flight handlers unwind, since they may need it on
            // their way out.
            lc.state = SvcState::Draining;
            drop(lc);
            self.step_down(term).await;
            lc = self.mu.lock().await;
        }

        lc.state = SvcState::Down;
        self.state_cv.notify_waiters();
    }

    /// Stops this instance: resigns leadership and waits for the matching
    /// step-down to complete. New lookups are poisoned as soon as the stop
    /// flag is set, even while leader references drain.
    pub async fn stop(&self) {
        {
            let mut lc = self.mu.lock().await;
            if lc.stop {
                debug!(pool = %self.uuid(), "already stopping");
                return;
            }
            debug!(pool = %self.uuid(), "stopping pool service");
            lc.stop = true;

            if matches!(lc.state, SvcState::Up | SvcState::UpEmpty) {
                // If we still lead lc.term, resigning triggers the matching
                // step-down callback; otherwise that callback is already
                // pending. Either way the service reaches Down.
                let term = lc.term;
                drop(lc);
                self.rdb().resign(term).await;
            }
        }

        loop {
            let lc = self.mu.lock().await;
            if lc.state == SvcState::Down {
                break;
            }
            // Register with the condition variable before releasing the
            // mutex, so a state change in between still wakes us.
            let notified = self.state_cv.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(lc);
            notified.await;
        }
    }
}

/// The callback descriptor handed to the replicated DB at start.
struct PoolSvcCbs {
    svc: std::sync::Weak<PoolSvc>,
    registry: std::sync::Weak<Registry>,
}

#[async_trait]
impl RdbCallbacks for PoolSvcCbs {
    async fn step_up(&self, term: Term) -> Result<(), PoolError> {
        match self.svc.upgrade() {
            Some(svc) => svc.step_up_cb(term).await,
            None => Ok(()),
        }
    }

    async fn step_down(&self, term: Term) {
        if let Some(svc) = self.svc.upgrade() {
            svc.step_down_cb(term).await;
        }
    }

    async fn stop(&self, err: Option<PoolError>) {
        let (Some(svc), Some(registry)) = (self.svc.upgrade(), self.registry.upgrade()) else {
            return;
        };
        if let Some(err) = err {
            warn!(pool = %svc.uuid(), error = %err, "db requested stop");
        }
        // Run the stopper detached: the callback may originate from inside
        // the DB and must not wait for the drain it triggers.
        tokio::spawn(async move {
            let uuid = svc.uuid();
            svc.stop().await;
            registry.remove(uuid);
        });
    }
}

/// Starts the pool service for `uuid` if its replicated DB exists on this
/// node. Starting an already-running service succeeds.
pub async fn start(
    registry: &Arc<Registry>,
    fabric: Fabric,
    config: Arc<Config>,
    uuid: Uuid,
) -> Result<Arc<PoolSvc>, PoolError> {
    if let Some(svc) = registry.get(uuid) {
        return Ok(svc);
    }

    let db_uuid = bootstrap::rdb_uuid_load(registry.storage_root(), uuid)?;
    let rdb = Rdb::start(db_uuid, fabric.self_rank, vec![fabric.self_rank]);
    let svc = Arc::new(PoolSvc::new(uuid, rdb.clone(), fabric, config));
    rdb.bind(Arc::new(PoolSvcCbs {
        svc: Arc::downgrade(&svc),
        registry: Arc::downgrade(registry),
    }));
    registry.insert(Arc::clone(&svc));

    // The embedded engine is single-replica: this node elects itself and the
    // step-up callback runs before campaign returns.
    rdb.campaign().await;

    debug!(pool = %uuid, "started pool service");
    Ok(svc)
}

/// Stops the pool service for `uuid`, removing it from the registry. Unknown
/// pools are ignored.
pub async fn stop(registry: &Arc<Registry>, uuid: Uuid) {
    let Ok(svc) = registry.lookup(uuid) else {
        return;
    };
    svc.stop().await;
    registry.remove(uuid);
}

/// Scans the storage root and starts every pool service found there. Errors
/// on individual pools are logged and skipped so other pools still start.
pub async fn start_all(
    registry: &Arc<Registry>,
    fabric: Fabric,
    config: Arc<Config>,
) -> Result<(), PoolError> {
    let entries = match std::fs::read_dir(registry.storage_root()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Ok(uuid) = Uuid::parse_str(&name) else {
            continue;
        };
        if !bootstrap::rdb_uuid_path(registry.storage_root(), uuid).exists() {
            debug!(pool = %uuid, "no rdb here, not starting");
            continue;
        }
        if let Err(e) = start(registry, fabric.clone(), Arc::clone(&config), uuid).await {
            error!(pool = %uuid, error = %e, "not starting pool service");
        }
    }
    Ok(())
}

/// Stops every running pool service, one task per service, and joins them
/// all before returning.
pub async fn stop_all(registry: &Arc<Registry>) {
    let mut tasks = JoinSet::new();
    for svc in registry.all() {
        let registry = Arc::clone(registry);
        tasks.spawn(async move {
            let uuid = svc.uuid();
            svc.stop().await;
            registry.remove(uuid);
        });
    }
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "pool service stopper panicked");
        }
    }
}

/// Destroys the pool service of `uuid` across all replicas: stops leader-side
/// rebuild tasks, asks for a distributed DB destroy, and tears down the pool
/// fabric group.
pub async fn svc_destroy(
    fabric: &Fabric,
    pool: Uuid,
) -> Result<(), PoolError> {
    fabric.rebuild.leader_stop(pool);
    fabric
        .rdb_dist
        .dist_stop(pool, None, true /* destroy */)
        .await
        .map_err(|e| {
            error!(%pool, error = %e, "failed to destroy pool service");
            e
        })?;
    fabric.targets.destroy_group(pool).await?;
    Ok(())
}
