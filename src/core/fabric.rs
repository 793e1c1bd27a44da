// src/core/fabric.rs

//! The cluster-facing collaborators of the pool service, each reduced to the
//! operation set the core actually consumes: the IV broadcast namespace, the
//! target-server fan-out, the container service, and distributed start/stop
//! of replicated DBs.
//!
//! The `Local*` implementations are the in-process fabric used by single-node
//! deployments and the test suite; they record the traffic they carry so
//! tests can assert on it.

use crate::core::PoolError;
use crate::core::broadcast::MapDistEntry;
use crate::core::fault::{self, FailLoc};
use crate::core::pool_map::{PoolMap, Rank};
use crate::core::rdb::{RdbPath, RdbTx};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;
use uuid::Uuid;

// --- IV (cluster broadcast) ---

/// How far a publication may shortcut the IV tree. Only `None` is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvShortcut {
    None,
}

/// Synchronization mode of a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvSync {
    /// Receivers may observe the entry after the call returns.
    Lazy,
    Eager,
}

/// An opaque descriptor other servers use to attach to a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvContext(pub Bytes);

/// One pool's broadcast namespace.
#[async_trait]
pub trait IvNamespace: Send + Sync {
    fn id(&self) -> u32;

    /// The global descriptor handed to target servers on connect.
    fn global_ctx(&self) -> IvContext;

    /// Publishes a pool map entry to every attached server.
    async fn publish(
        &self,
        entry: MapDistEntry,
        shortcut: IvShortcut,
        sync: IvSync,
    ) -> Result<(), PoolError>;
}

/// Creates or finds per-pool namespaces.
#[async_trait]
pub trait IvBus: Send + Sync {
    async fn create_namespace(&self, pool: Uuid) -> Result<Arc<dyn IvNamespace>, PoolError>;
}

// --- Target server fan-out ---

/// A TGT_CONNECT fan-out payload: every target server learns about the new
/// handle and how to attach to the pool's IV namespace.
#[derive(Debug, Clone)]
pub struct TgtConnectReq {
    pub pool: Uuid,
    pub handle: Uuid,
    pub capas: u64,
    pub map_version: u32,
    pub iv_ns_id: u32,
    pub iv_ctx: IvContext,
    pub master_rank: Rank,
}

/// Broadcast operations against every target server of a pool. A failure on
/// any target surfaces as an error and the caller aborts its transaction.
#[async_trait]
pub trait TargetFanout: Send + Sync {
    /// Ensures the fabric group for the pool exists (created at step-up).
    async fn ensure_group(&self, pool: Uuid, map: &PoolMap) -> Result<(), PoolError>;

    /// Tears the fabric group down (pool destroy).
    async fn destroy_group(&self, pool: Uuid) -> Result<(), PoolError>;

    async fn tgt_connect(&self, req: TgtConnectReq) -> Result<(), PoolError>;

    async fn tgt_disconnect(&self, pool: Uuid, handles: &[Uuid]) -> Result<(), PoolError>;
}

// --- Container service ---

/// The container service co-hosted with every pool service. The pool service
/// initializes its metadata at CREATE and closes containers when handles go
/// away.
#[async_trait]
pub trait ContainerService: Send + Sync {
    /// Adds the container metadata to the pool's CREATE transaction.
    fn init_metadata(&self, tx: &mut RdbTx, root: &RdbPath, pool: Uuid)
    -> Result<(), PoolError>;

    /// Closes every container opened under the given pool handles.
    async fn close_by_pool_handles(&self, pool: Uuid, handles: &[Uuid])
    -> Result<(), PoolError>;

    fn step_up(&self, pool: Uuid);

    fn step_down(&self, pool: Uuid);
}

// --- Distributed replicated-DB management ---

/// Starts and stops replicated DBs across ranks (pool service creation,
/// destruction, and replica membership changes).
#[async_trait]
pub trait RdbDist: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn dist_start(
        &self,
        db_uuid: Uuid,
        pool: Uuid,
        ranks: &[Rank],
        create: bool,
        bootstrap: bool,
        cap_bytes: u64,
    ) -> Result<(), PoolError>;

    async fn dist_stop(
        &self,
        pool: Uuid,
        ranks: Option<&[Rank]>,
        destroy: bool,
    ) -> Result<(), PoolError>;
}

/// The collaborator bundle handed to every service instance.
#[derive(Clone)]
pub struct Fabric {
    pub self_rank: Rank,
    pub iv: Arc<dyn IvBus>,
    pub targets: Arc<dyn TargetFanout>,
    pub containers: Arc<dyn ContainerService>,
    pub rebuild: Arc<dyn crate::core::rebuild::RebuildScheduler>,
    pub rdb_dist: Arc<dyn RdbDist>,
}

// --- Local (in-process) implementations ---

/// A recording IV namespace.
pub struct LocalIvNamespace {
    id: u32,
    pool: Uuid,
    published: Mutex<Vec<MapDistEntry>>,
    /// When set, publications fail with `Nonexist` as if no receiver had the
    /// namespace; the broadcaster must tolerate this.
    pub absent_on_receivers: AtomicBool,
}

impl LocalIvNamespace {
    pub fn published(&self) -> Vec<MapDistEntry> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl IvNamespace for LocalIvNamespace {
    fn id(&self) -> u32 {
        self.id
    }

    fn global_ctx(&self) -> IvContext {
        IvContext(Bytes::copy_from_slice(self.pool.as_bytes()))
    }

    async fn publish(
        &self,
        entry: MapDistEntry,
        _shortcut: IvShortcut,
        _sync: IvSync,
    ) -> Result<(), PoolError> {
        if fault::check(FailLoc::MapBroadcast) {
            return Err(PoolError::TargetIo("injected broadcast failure".into()));
        }
        if self.absent_on_receivers.load(Ordering::Relaxed) {
            return Err(PoolError::Nonexist);
        }
        debug!(pool = %entry.pool, version = entry.version, "iv publish");
        self.published.lock().push(entry);
        Ok(())
    }
}

/// A recording IV bus handing out one namespace per pool.
#[derive(Default)]
pub struct LocalIvBus {
    next_id: AtomicU32,
    namespaces: DashMap<Uuid, Arc<LocalIvNamespace>>,
}

impl LocalIvBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(&self, pool: Uuid) -> Option<Arc<LocalIvNamespace>> {
        self.namespaces.get(&pool).map(|ns| Arc::clone(&ns))
    }
}

#[async_trait]
impl IvBus for LocalIvBus {
    async fn create_namespace(&self, pool: Uuid) -> Result<Arc<dyn IvNamespace>, PoolError> {
        let ns = self
            .namespaces
            .entry(pool)
            .or_insert_with(|| {
                Arc::new(LocalIvNamespace {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    pool,
                    published: Mutex::new(Vec::new()),
                    absent_on_receivers: AtomicBool::new(false),
                })
            })
            .clone();
        Ok(ns)
    }
}

/// A recording target fan-out with switchable failures.
#[derive(Default)]
pub struct LocalTargetFanout {
    connects: Mutex<Vec<TgtConnectReq>>,
    disconnects: Mutex<Vec<(Uuid, Vec<Uuid>)>>,
    groups: Mutex<Vec<Uuid>>,
    pub fail_connect: AtomicBool,
    pub fail_disconnect: AtomicBool,
}

impl LocalTargetFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connects(&self) -> Vec<TgtConnectReq> {
        self.connects.lock().clone()
    }

    pub fn disconnects(&self) -> Vec<(Uuid, Vec<Uuid>)> {
        self.disconnects.lock().clone()
    }

    pub fn groups(&self) -> Vec<Uuid> {
        self.groups.lock().clone()
    }
}

#[async_trait]
impl TargetFanout for LocalTargetFanout {
    async fn ensure_group(&self, pool: Uuid, _map: &PoolMap) -> Result<(), PoolError> {
        let mut groups = self.groups.lock();
        if !groups.contains(&pool) {
            groups.push(pool);
        }
        Ok(())
    }

    async fn destroy_group(&self, pool: Uuid) -> Result<(), PoolError> {
        self.groups.lock().retain(|p| *p != pool);
        Ok(())
    }

    async fn tgt_connect(&self, req: TgtConnectReq) -> Result<(), PoolError> {
        if self.fail_connect.load(Ordering::Relaxed) || fault::check(FailLoc::TargetConnect) {
            return Err(PoolError::TargetIo("target connect fan-out failed".into()));
        }
        self.connects.lock().push(req);
        Ok(())
    }

    async fn tgt_disconnect(&self, pool: Uuid, handles: &[Uuid]) -> Result<(), PoolError> {
        if self.fail_disconnect.load(Ordering::Relaxed) {
            return Err(PoolError::TargetIo(
                "target disconnect fan-out failed".into(),
            ));
        }
        self.disconnects.lock().push((pool, handles.to_vec()));
        Ok(())
    }
}

/// A recording container service. Its CREATE-time metadata is a sub-KVS under
/// the pool root.
#[derive(Default)]
pub struct LocalContainerService {
    closed: Mutex<Vec<(Uuid, Vec<Uuid>)>>,
}

/// Key of the container metadata sub-KVS inside the pool root.
pub const CONTAINERS_KEY: &[u8] = b"containers";

impl LocalContainerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closed(&self) -> Vec<(Uuid, Vec<Uuid>)> {
        self.closed.lock().clone()
    }
}

#[async_trait]
impl ContainerService for LocalContainerService {
    fn init_metadata(
        &self,
        tx: &mut RdbTx,
        root: &RdbPath,
        _pool: Uuid,
    ) -> Result<(), PoolError> {
        tx.create_kvs(root, CONTAINERS_KEY, crate::core::layout::SUB_KVS_ATTR);
        Ok(())
    }

    async fn close_by_pool_handles(
        &self,
        pool: Uuid,
        handles: &[Uuid],
    ) -> Result<(), PoolError> {
        self.closed.lock().push((pool, handles.to_vec()));
        Ok(())
    }

    fn step_up(&self, _pool: Uuid) {}

    fn step_down(&self, _pool: Uuid) {}
}

/// A recording distributed-DB manager.
#[derive(Default)]
pub struct LocalRdbDist {
    started: Mutex<Vec<(Uuid, Uuid, Vec<Rank>)>>,
    stopped: Mutex<Vec<(Uuid, bool)>>,
}

impl LocalRdbDist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<(Uuid, Uuid, Vec<Rank>)> {
        self.started.lock().clone()
    }

    pub fn stopped(&self) -> Vec<(Uuid, bool)> {
        self.stopped.lock().clone()
    }
}

#[async_trait]
impl RdbDist for LocalRdbDist {
    async fn dist_start(
        &self,
        db_uuid: Uuid,
        pool: Uuid,
        ranks: &[Rank],
        _create: bool,
        _bootstrap: bool,
        _cap_bytes: u64,
    ) -> Result<(), PoolError> {
        self.started.lock().push((db_uuid, pool, ranks.to_vec()));
        Ok(())
    }

    async fn dist_stop(
        &self,
        pool: Uuid,
        _ranks: Option<&[Rank]>,
        destroy: bool,
    ) -> Result<(), PoolError> {
        self.stopped.lock().push((pool, destroy));
        Ok(())
    }
}

/// The full in-process fabric, with the concrete collaborators kept around so
/// callers can inspect what happened.
pub struct LocalFabric {
    pub iv: Arc<LocalIvBus>,
    pub targets: Arc<LocalTargetFanout>,
    pub containers: Arc<LocalContainerService>,
    pub rebuild: Arc<crate::core::rebuild::LocalRebuild>,
    pub rdb_dist: Arc<LocalRdbDist>,
    pub fabric: Fabric,
}

impl LocalFabric {
    pub fn new(self_rank: Rank) -> LocalFabric {
        let iv = Arc::new(LocalIvBus::new());
        let targets = Arc::new(LocalTargetFanout::new());
        let containers = Arc::new(LocalContainerService::new());
        let rebuild = Arc::new(crate::core::rebuild::LocalRebuild::new());
        let rdb_dist = Arc::new(LocalRdbDist::new());
        let fabric = Fabric {
            self_rank,
            iv: iv.clone(),
            targets: targets.clone(),
            containers: containers.clone(),
            rebuild: rebuild.clone(),
            rdb_dist: rdb_dist.clone(),
        };
        LocalFabric {
            iv,
            targets,
            containers,
            rebuild,
            rdb_dist,
            fabric,
        }
    }
}
