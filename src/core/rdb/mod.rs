// src/core/rdb/mod.rs

//! The replicated DB (RDB) underneath every pool service.
//!
//! Consensus internals (election, log replication, snapshotting) are not this
//! crate's business: the pool service consumes a narrow interface — keyed KVS
//! transactions bound to a leadership term, leader hints, resignation, and
//! the step-up/step-down/stop callback descriptor. This module specifies that
//! interface and carries the embedded single-process engine that implements
//! it for local deployments and the test suite.

pub mod store;
pub mod tx;

pub use tx::RdbTx;

use crate::core::PoolError;
use crate::core::pool_map::Rank;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use store::Forest;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A leadership term of the replicated DB.
pub type Term = u64;

/// Bound a transaction to no particular term: commit succeeds as long as this
/// replica is the leader at commit time. Used only by CREATE, which may run
/// before the service finishes stepping up.
pub const NIL_TERM: Term = u64::MAX;

/// The class of a KVS created inside the DB. Only generic (binary-keyed)
/// KVSes are needed by the pool schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvsClass {
    Generic,
}

/// Creation attributes for a KVS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvsAttr {
    pub class: KvsClass,
    /// B-tree order of the backing store.
    pub order: u8,
}

/// Where the current leader is believed to live. Embedded in every RPC reply
/// so clients can re-target without an extra round trip.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, bincode::Encode,
    bincode::Decode,
)]
pub struct LeaderHint {
    pub term: Term,
    pub rank: Rank,
    pub valid: bool,
}

/// A path from the DB root to one KVS. Cloning is cheap; paths are a handful
/// of short keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RdbPath {
    segments: Vec<Bytes>,
}

impl RdbPath {
    /// The root KVS of the DB.
    pub fn root() -> Self {
        Self::default()
    }

    /// Descends into the sub-KVS stored under `key`.
    pub fn child(&self, key: &[u8]) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Bytes::copy_from_slice(key));
        Self { segments }
    }

    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }
}

/// The callbacks a DB delivers to its hosting service. `step_up` and
/// `step_down` are invoked at most once per term, in term order; `stop` asks
/// the host to wind the service down (fatal storage error, orderly removal).
#[async_trait]
pub trait RdbCallbacks: Send + Sync {
    async fn step_up(&self, term: Term) -> Result<(), PoolError>;
    async fn step_down(&self, term: Term);
    async fn stop(&self, err: Option<PoolError>);
}

struct Role {
    term: Term,
    is_leader: bool,
    leader: Option<Rank>,
}

pub(crate) struct RdbInner {
    uuid: Uuid,
    self_rank: Rank,
    pub(crate) forest: RwLock<Forest>,
    role: Mutex<Role>,
    replicas: RwLock<Vec<Rank>>,
    cbs: Mutex<Option<Arc<dyn RdbCallbacks>>>,
}

/// A handle to one replicated DB.
#[derive(Clone)]
pub struct Rdb {
    pub(crate) inner: Arc<RdbInner>,
}

impl Rdb {
    /// Starts a DB identified by `uuid` on this rank. The DB comes up as a
    /// follower at term 0; leadership is acquired via [`Rdb::campaign`].
    pub fn start(uuid: Uuid, self_rank: Rank, replicas: Vec<Rank>) -> Rdb {
        Rdb {
            inner: Arc::new(RdbInner {
                uuid,
                self_rank,
                forest: RwLock::new(Forest::new()),
                role: Mutex::new(Role {
                    term: 0,
                    is_leader: false,
                    leader: None,
                }),
                replicas: RwLock::new(replicas),
                cbs: Mutex::new(None),
            }),
        }
    }

    /// Registers the callback descriptor. Must happen before leadership
    /// changes are driven.
    pub fn bind(&self, cbs: Arc<dyn RdbCallbacks>) {
        *self.inner.cbs.lock() = Some(cbs);
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn self_rank(&self) -> Rank {
        self.inner.self_rank
    }

    /// The ranks currently holding replicas of this DB.
    pub fn get_ranks(&self) -> Vec<Rank> {
        self.inner.replicas.read().clone()
    }

    /// The latest leader hint. Invalid until a leader has been observed.
    pub fn leader_hint(&self) -> LeaderHint {
        let role = self.inner.role.lock();
        match role.leader {
            Some(rank) => LeaderHint {
                term: role.term,
                rank,
                valid: true,
            },
            None => LeaderHint {
                term: role.term,
                rank: 0,
                valid: false,
            },
        }
    }

    /// The current term.
    pub fn term(&self) -> Term {
        self.inner.role.lock().term
    }

    pub fn is_leader(&self) -> bool {
        self.inner.role.lock().is_leader
    }

    /// Becomes leader for the next term and delivers the step-up callback.
    /// Returns the new term.
    pub async fn campaign(&self) -> Term {
        let (term, cbs) = {
            let mut role = self.inner.role.lock();
            role.term += 1;
            role.is_leader = true;
            role.leader = Some(self.inner.self_rank);
            (role.term, self.inner.cbs.lock().clone())
        };
        info!(db = %self.inner.uuid, term, "stepping up as leader");
        if let Some(cbs) = cbs {
            if let Err(e) = cbs.step_up(term).await {
                warn!(db = %self.inner.uuid, term, error = %e, "step-up callback failed");
            }
        }
        term
    }

    /// Loses leadership without a successor and delivers the step-down
    /// callback for the current term.
    pub async fn demote(&self) {
        let (term, was_leader, cbs) = {
            let mut role = self.inner.role.lock();
            let was = role.is_leader;
            role.is_leader = false;
            role.leader = None;
            (role.term, was, self.inner.cbs.lock().clone())
        };
        if !was_leader {
            return;
        }
        info!(db = %self.inner.uuid, term, "stepping down");
        if let Some(cbs) = cbs {
            cbs.step_down(term).await;
        }
    }

    /// Resigns leadership of `term`. A no-op when the leadership already
    /// moved on; the matching step-down callback is either delivered here or
    /// already pending.
    pub async fn resign(&self, term: Term) {
        let current = {
            let role = self.inner.role.lock();
            if !role.is_leader || role.term != term {
                debug!(db = %self.inner.uuid, term, "resign for a stale term ignored");
                return;
            }
            role.term
        };
        debug_assert_eq!(current, term);
        self.demote().await;
    }

    /// Asks the hosting service to stop, via the stop callback.
    pub async fn trigger_stop(&self, err: Option<PoolError>) {
        let cbs = self.inner.cbs.lock().clone();
        if let Some(cbs) = cbs {
            cbs.stop(err).await;
        }
    }

    /// Starts replicas of this DB on `ranks` and adds them to membership.
    pub fn add_replicas(&self, ranks: &[Rank]) -> Result<(), PoolError> {
        let mut replicas = self.inner.replicas.write();
        for rank in ranks {
            if !replicas.contains(rank) {
                replicas.push(*rank);
            }
        }
        Ok(())
    }

    /// Removes `ranks` from membership. Removing every replica is refused.
    pub fn remove_replicas(&self, ranks: &[Rank]) -> Result<(), PoolError> {
        let mut replicas = self.inner.replicas.write();
        let remaining: Vec<Rank> = replicas
            .iter()
            .copied()
            .filter(|r| !ranks.contains(r))
            .collect();
        if remaining.is_empty() {
            return Err(PoolError::Inval(
                "cannot remove the last DB replica".into(),
            ));
        }
        *replicas = remaining;
        Ok(())
    }

    /// Begins a transaction bound to `term` (or [`NIL_TERM`]). Every
    /// operation inside the transaction, and the final commit, fail with
    /// `NotLeader` if leadership of that term is lost in the meantime.
    pub fn tx_begin(&self, term: Term) -> RdbTx {
        RdbTx::new(self.clone(), term)
    }

    /// Fails with `NotLeader` (hint attached) unless this replica currently
    /// leads `term`.
    pub(crate) fn check_leadership(&self, term: Term) -> Result<(), PoolError> {
        let role = self.inner.role.lock();
        let ok = role.is_leader && (term == NIL_TERM || role.term == term);
        drop(role);
        if ok {
            Ok(())
        } else {
            Err(PoolError::NotLeader {
                hint: self.leader_hint(),
            })
        }
    }
}
