// src/core/svc/mod.rs

//! The per-pool service instance: a replicated state machine whose leader
//! serves all pool metadata RPCs.
//!
//! One `PoolSvc` exists per pool per process, registered in the process-wide
//! [`Registry`](crate::core::registry::Registry). The replicated DB drives
//! the lifecycle through its step-up/step-down/stop callbacks; handlers only
//! run while the instance is `Up` and hold a leader reference for their whole
//! execution so step-down can drain them.

pub mod attrs;
pub mod connect;
pub mod create;
pub mod disconnect;
pub mod dispatch;
pub mod lifecycle;
pub mod query;
pub mod replicas;
pub mod update;

use crate::core::PoolError;
use crate::core::fabric::{Fabric, IvNamespace};
use crate::core::layout;
use crate::core::pool_map::PoolMap;
use crate::core::rdb::{Rdb, RdbPath, Term};
use crate::core::registry::Registry;
use crate::config::Config;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Lifecycle states of a pool service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcState {
    /// Not leading; handlers are refused with a leader hint.
    Down,
    /// Leading, but the DB holds no pool metadata yet; only CREATE may run.
    UpEmpty,
    /// Leading and serving.
    Up,
    /// Stepping down; draining leader references.
    Draining,
}

/// Lifecycle fields guarded by the service mutex.
pub(crate) struct Lifecycle {
    pub state: SvcState,
    pub term: Term,
    pub stop: bool,
}

/// One pool's service instance.
pub struct PoolSvc {
    uuid: Uuid,
    rdb: Rdb,
    root: RdbPath,
    handles: RdbPath,
    user: RdbPath,
    fabric: Fabric,
    config: Arc<Config>,

    /// Lifecycle fields and their condition variable.
    pub(crate) mu: Mutex<Lifecycle>,
    pub(crate) state_cv: Notify,

    /// Leader references held by in-flight handlers. Taken under `mu`;
    /// released lock-free so guards can drop anywhere.
    pub(crate) leader_refs: AtomicU32,
    pub(crate) leader_cv: Notify,

    /// Serializes RDB transactions on this pool's data: writers exclusive,
    /// readers shared. Held for the whole transaction, including bulk
    /// transfers, which may suspend.
    pub(crate) ps_lock: RwLock<()>,

    /// The cached committed pool map, swapped on commit.
    pub(crate) cache: RwLock<Option<Arc<PoolMap>>>,

    /// The pool's IV namespace, created lazily on the first CONNECT.
    pub(crate) iv_ns: Mutex<Option<Arc<dyn IvNamespace>>>,
}

impl std::fmt::Debug for PoolSvc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSvc").field("uuid", &self.uuid).finish()
    }
}

impl PoolSvc {
    pub(crate) fn new(uuid: Uuid, rdb: Rdb, fabric: Fabric, config: Arc<Config>) -> PoolSvc {
        let root = RdbPath::root();
        let handles = root.child(layout::ATTR_HANDLES);
        let user = root.child(layout::ATTR_USER);
        PoolSvc {
            uuid,
            rdb,
            root,
            handles,
            user,
            fabric,
            config,
            mu: Mutex::new(Lifecycle {
                state: SvcState::Down,
                term: 0,
                stop: false,
            }),
            state_cv: Notify::new(),
            leader_refs: AtomicU32::new(0),
            leader_cv: Notify::new(),
            ps_lock: RwLock::new(()),
            cache: RwLock::new(None),
            iv_ns: Mutex::new(None),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn rdb(&self) -> &Rdb {
        &self.rdb
    }

    pub(crate) fn root(&self) -> &RdbPath {
        &self.root
    }

    pub(crate) fn handles_path(&self) -> &RdbPath {
        &self.handles
    }

    pub(crate) fn user_path(&self) -> &RdbPath {
        &self.user
    }

    pub(crate) fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// The term this instance last stepped up in.
    pub async fn term(&self) -> Term {
        self.mu.lock().await.term
    }

    /// The current lifecycle state.
    pub async fn state(&self) -> SvcState {
        self.mu.lock().await.state
    }

    /// Version of the cached committed map, or zero before step-up.
    pub async fn cached_version(&self) -> u32 {
        self.cache.read().await.as_ref().map_or(0, |m| m.version())
    }

    /// A shared view of the cached committed map.
    pub async fn cached_map(&self) -> Option<Arc<PoolMap>> {
        self.cache.read().await.clone()
    }

    /// Returns the pool's IV namespace, creating it on first use.
    pub(crate) async fn ensure_iv_ns(&self) -> Result<Arc<dyn IvNamespace>, PoolError> {
        let mut ns = self.iv_ns.lock().await;
        if let Some(ns) = ns.as_ref() {
            return Ok(Arc::clone(ns));
        }
        let created = self.fabric.iv.create_namespace(self.uuid).await?;
        debug!(pool = %self.uuid, ns = created.id(), "created iv namespace");
        *ns = Some(Arc::clone(&created));
        Ok(created)
    }

    /// The IV namespace if one exists; `None` means no client ever connected
    /// and there is nobody to broadcast to.
    pub(crate) async fn iv_ns(&self) -> Option<Arc<dyn IvNamespace>> {
        self.iv_ns.lock().await.clone()
    }
}

/// The process-wide module context: the registry plus the collaborator
/// bundle, passed to every handler instead of ambient globals.
pub struct PoolModule {
    pub registry: Arc<Registry>,
    pub fabric: Fabric,
    pub config: Arc<Config>,
}

impl PoolModule {
    /// Initializes the module. Pool services are not started here; use
    /// [`lifecycle::start_all`] after initialization.
    pub fn init(config: Arc<Config>, fabric: Fabric) -> Arc<PoolModule> {
        let registry = Arc::new(Registry::new(config.storage_path.clone()));
        Arc::new(PoolModule {
            registry,
            fabric,
            config,
        })
    }

    /// Tears the module down: stops every running pool service.
    pub async fn fini(&self) {
        lifecycle::stop_all(&self.registry).await;
    }
}
