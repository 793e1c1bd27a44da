// src/core/registry.rs

//! The process-wide table of running pool services, keyed by pool UUID.
//!
//! Lookup distinguishes "this pool has no replica here" (`Nonexist`, judged
//! by the on-disk bootstrap state) from "a replica exists but is not serving"
//! (`NotLeader`), so clients know whether to re-target or give up.

use crate::core::PoolError;
use crate::core::bootstrap;
use crate::core::rdb::LeaderHint;
use crate::core::svc::{PoolSvc, SvcState};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use uuid::Uuid;

pub struct Registry {
    svcs: DashMap<Uuid, Arc<PoolSvc>>,
    storage_root: PathBuf,
}

impl Registry {
    pub fn new(storage_root: PathBuf) -> Registry {
        Registry {
            svcs: DashMap::new(),
            storage_root,
        }
    }

    pub fn storage_root(&self) -> &PathBuf {
        &self.storage_root
    }

    pub(crate) fn insert(&self, svc: Arc<PoolSvc>) {
        self.svcs.insert(svc.uuid(), svc);
    }

    pub(crate) fn remove(&self, uuid: Uuid) {
        self.svcs.remove(&uuid);
    }

    pub fn get(&self, uuid: Uuid) -> Option<Arc<PoolSvc>> {
        self.svcs.get(&uuid).map(|svc| Arc::clone(&svc))
    }

    /// Every running service, for start-all/stop-all fan-out.
    pub fn all(&self) -> Vec<Arc<PoolSvc>> {
        self.svcs.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Looks a service up without checking whether it serves. When no service
    /// is running, the on-disk bootstrap state decides between `Nonexist`
    /// (no replica of this pool lives here) and `NotLeader` (a replica
    /// exists; the client should try elsewhere).
    pub fn lookup(&self, uuid: Uuid) -> Result<Arc<PoolSvc>, PoolError> {
        if let Some(svc) = self.get(uuid) {
            return Ok(svc);
        }
        if bootstrap::rdb_uuid_path(&self.storage_root, uuid).exists() {
            Err(PoolError::NotLeader {
                hint: LeaderHint::default(),
            })
        } else {
            Err(PoolError::Nonexist)
        }
    }

    /// The general RPC prologue: look the service up, verify it is up, and
    /// take a leader reference so step-down waits for this handler.
    pub async fn lookup_leader(&self, uuid: Uuid) -> Result<LeaderGuard, PoolError> {
        let svc = self.lookup(uuid)?;
        let lc = svc.mu.lock().await;
        if lc.stop || lc.state != SvcState::Up {
            drop(lc);
            return Err(PoolError::NotLeader {
                hint: svc.rdb().leader_hint(),
            });
        }
        svc.leader_refs.fetch_add(1, Ordering::SeqCst);
        drop(lc);
        Ok(LeaderGuard { svc })
    }

    /// The latest leader hint for a pool, if a service instance exists.
    pub fn peek_hint(&self, uuid: Uuid) -> Option<LeaderHint> {
        self.get(uuid).map(|svc| svc.rdb().leader_hint())
    }

    /// The cached map version for a pool, or zero.
    pub async fn peek_map_version(&self, uuid: Uuid) -> u32 {
        match self.get(uuid) {
            Some(svc) => svc.cached_version().await,
            None => 0,
        }
    }
}

/// A leader reference: kept alive for the duration of one handler. Step-down
/// blocks until every guard is dropped.
pub struct LeaderGuard {
    svc: Arc<PoolSvc>,
}

impl LeaderGuard {
    pub fn svc(&self) -> &Arc<PoolSvc> {
        &self.svc
    }
}

impl std::ops::Deref for LeaderGuard {
    type Target = PoolSvc;

    fn deref(&self) -> &PoolSvc {
        &self.svc
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if self.svc.leader_refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            // notify_one stores a permit, so a step-down that has not
            // started waiting yet still observes the release.
            self.svc.leader_cv.notify_one();
        }
    }
}
