// src/core/rebuild.rs

//! The bridge to the rebuild subsystem.
//!
//! Rebuild itself (object re-replication across surviving targets) is an
//! external collaborator; the pool service schedules it after a committed
//! exclusion, resumes interrupted runs at step-up, and tears its leader-side
//! tasks down at step-down.

use crate::core::PoolError;
use crate::core::fault::{self, FailLoc};
use crate::core::pool_map::{Rank, TargetId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::env;
use uuid::Uuid;

const REBUILD_ENV: &str = "PERIDOT_REBUILD";
const REBUILD_ENV_DISABLED: &str = "disabled";

/// The rebuild progress embedded in CONNECT and QUERY replies.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode,
    bincode::Decode,
)]
pub struct RebuildStatus {
    /// Map version the running (or last finished) rebuild was scheduled for.
    pub version: u32,
    pub done: bool,
    /// Zero, or the error the last rebuild failed with.
    pub errno: i32,
}

/// The operation set the pool service drives on the rebuild subsystem.
#[async_trait]
pub trait RebuildScheduler: Send + Sync {
    /// Schedules a rebuild for the targets excluded in `map_version`, run
    /// over the service replicas captured at commit time.
    async fn schedule(
        &self,
        pool: Uuid,
        map_version: u32,
        excluded: &[TargetId],
        replicas: &[Rank],
    ) -> Result<(), PoolError>;

    /// Resumes rebuilds that were in flight under an earlier leader.
    async fn regenerate(&self, pool: Uuid, replicas: &[Rank]) -> Result<(), PoolError>;

    /// Stops leader-side rebuild tasks (step-down, destroy).
    fn leader_stop(&self, pool: Uuid);

    async fn query(&self, pool: Uuid) -> Result<RebuildStatus, PoolError>;
}

/// Whether rebuild scheduling is suppressed for this process.
pub fn rebuild_disabled() -> bool {
    if fault::check(FailLoc::RebuildDisable) {
        return true;
    }
    env::var(REBUILD_ENV)
        .map(|v| v.eq_ignore_ascii_case(REBUILD_ENV_DISABLED))
        .unwrap_or(false)
}

/// One recorded schedule request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRebuild {
    pub pool: Uuid,
    pub map_version: u32,
    pub excluded: Vec<TargetId>,
    pub replicas: Vec<Rank>,
}

/// The in-process rebuild collaborator used by single-node deployments and
/// the test suite: records every request and answers queries from the record.
#[derive(Default)]
pub struct LocalRebuild {
    scheduled: Mutex<Vec<ScheduledRebuild>>,
    regenerated: Mutex<Vec<(Uuid, Vec<Rank>)>>,
    stopped: Mutex<Vec<Uuid>>,
}

impl LocalRebuild {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<ScheduledRebuild> {
        self.scheduled.lock().clone()
    }

    pub fn regenerated(&self) -> Vec<(Uuid, Vec<Rank>)> {
        self.regenerated.lock().clone()
    }

    pub fn stopped(&self) -> Vec<Uuid> {
        self.stopped.lock().clone()
    }
}

#[async_trait]
impl RebuildScheduler for LocalRebuild {
    async fn schedule(
        &self,
        pool: Uuid,
        map_version: u32,
        excluded: &[TargetId],
        replicas: &[Rank],
    ) -> Result<(), PoolError> {
        self.scheduled.lock().push(ScheduledRebuild {
            pool,
            map_version,
            excluded: excluded.to_vec(),
            replicas: replicas.to_vec(),
        });
        Ok(())
    }

    async fn regenerate(&self, pool: Uuid, replicas: &[Rank]) -> Result<(), PoolError> {
        self.regenerated.lock().push((pool, replicas.to_vec()));
        Ok(())
    }

    fn leader_stop(&self, pool: Uuid) {
        self.stopped.lock().push(pool);
    }

    async fn query(&self, pool: Uuid) -> Result<RebuildStatus, PoolError> {
        let scheduled = self.scheduled.lock();
        Ok(scheduled
            .iter()
            .rev()
            .find(|s| s.pool == pool)
            .map(|s| RebuildStatus {
                version: s.map_version,
                done: true,
                errno: 0,
            })
            .unwrap_or_default())
    }
}
