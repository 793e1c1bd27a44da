// src/core/pool_map/update.rs

//! Target state mutations. Transitions are deterministic on
//! `(current status, requested operation)`; unknown target ids are ignored so
//! that a membership change can be retried against a newer map without
//! tripping over ids that were already drained out.

use super::{ComponentState, PoolMap, TargetId};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::debug;

/// A membership-change operation applied to a set of targets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode,
    bincode::Decode, Display,
)]
pub enum UpdateOp {
    /// Take targets out of I/O service; rebuild re-replicates their data.
    Exclude,
    /// Mark already-excluded targets as fully drained.
    ExcludeOut,
    /// Bring targets (back) into I/O service.
    Add,
    /// Mark targets as fully integrated.
    AddIn,
}

/// The status a target moves to under `op`, or `None` when the operation does
/// not apply to its current status.
fn transition(current: ComponentState, op: UpdateOp) -> Option<ComponentState> {
    match (op, current) {
        (UpdateOp::Exclude, ComponentState::Up)
        | (UpdateOp::Exclude, ComponentState::UpIn)
        | (UpdateOp::Exclude, ComponentState::New) => Some(ComponentState::Down),
        (UpdateOp::Exclude, _) => None,

        (UpdateOp::ExcludeOut, ComponentState::Down) => Some(ComponentState::DownOut),
        (UpdateOp::ExcludeOut, _) => None,

        (UpdateOp::Add, ComponentState::Down)
        | (UpdateOp::Add, ComponentState::DownOut)
        | (UpdateOp::Add, ComponentState::New) => Some(ComponentState::Up),
        (UpdateOp::Add, _) => None,

        (UpdateOp::AddIn, ComponentState::UpIn) => None,
        (UpdateOp::AddIn, _) => Some(ComponentState::UpIn),
    }
}

impl PoolMap {
    /// Applies `op` to the targets named by `ids`. Ids not present in the map
    /// are ignored silently. The map version is incremented if and only if at
    /// least one target actually changed status; the new version is stamped
    /// onto every changed component, and excluded targets record it as their
    /// fail sequence.
    ///
    /// Returns the resulting map version.
    pub fn apply_update(&mut self, ids: &[TargetId], op: UpdateOp) -> u32 {
        let mut changes = 0usize;
        let new_version = self.version() + 1;

        for domain in self.domains_mut() {
            for node in &mut domain.nodes {
                for target in &mut node.targets {
                    if !ids.contains(&target.comp.id) {
                        continue;
                    }
                    let Some(next) = transition(target.comp.status, op) else {
                        continue;
                    };
                    debug!(
                        target_id = target.comp.id,
                        from = %target.comp.status,
                        to = %next,
                        %op,
                        "target state transition"
                    );
                    target.comp.status = next;
                    target.comp.ver = new_version;
                    if op == UpdateOp::Exclude {
                        target.comp.fseq = new_version;
                    }
                    changes += 1;
                }
            }
        }

        if changes > 0 {
            self.set_version(new_version);
        }
        self.version()
    }
}
