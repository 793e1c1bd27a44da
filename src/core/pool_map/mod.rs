// src/core/pool_map/mod.rs

//! The in-memory pool topology: a versioned tree of fault domains, server
//! nodes, and I/O targets, plus the packed wire representation exchanged with
//! clients and target servers.
//!
//! The authoritative copy of a pool's map lives on its service instance and
//! is swapped atomically (behind the instance's map lock) whenever a
//! membership change commits. Everyone else holds an `Arc<PoolMap>` view.

pub mod codec;
pub mod update;

pub use codec::{COMPONENT_WIRE_SIZE, POOL_BUF_HEADER_SIZE, PoolBuf, buffer_size};
pub use update::UpdateOp;

use crate::core::PoolError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use strum_macros::Display;

/// A server rank: one storage server process in the fabric group.
pub type Rank = u32;

/// A globally unique target identifier within one pool map.
pub type TargetId = u32;

/// The kind of a pool map component. Components are packed in this declared
/// order: all domains, then all nodes, then all targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ComponentKind {
    Domain,
    Node,
    Target,
}

/// The lifecycle status of a component. Only targets transition at runtime;
/// domains and nodes keep the status they were created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ComponentState {
    /// Available for I/O but not yet integrated (data may still be moving in).
    Up,
    /// Fully integrated member of the pool.
    UpIn,
    /// Excluded from I/O; rebuild may still be re-replicating its data.
    Down,
    /// Excluded and fully drained; safe to remove from the topology.
    DownOut,
    /// Newly added, not yet activated.
    New,
}

/// One packed pool map component. The same record shape describes domains,
/// nodes, and targets; the `kind` discriminates which fields are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub kind: ComponentKind,
    pub status: ComponentState,
    /// Ordinal of this component among its siblings.
    pub index: u32,
    /// Unique id within the kind: domain ordinal, node id, or target id.
    pub id: u32,
    /// Owning server rank. Zero for domains.
    pub rank: Rank,
    /// Map version in which this component was created or last changed.
    pub ver: u32,
    /// Fail sequence: the map version of the last exclusion. Only grows.
    pub fseq: u32,
    /// Child count: nodes per domain, streams per node, 1 for targets.
    pub nr: u32,
}

/// A target leaf in the built tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub comp: Component,
}

impl Target {
    pub fn id(&self) -> TargetId {
        self.comp.id
    }

    pub fn status(&self) -> ComponentState {
        self.comp.status
    }
}

/// A node (one rank) in the built tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub comp: Component,
    pub targets: Vec<Target>,
}

impl Node {
    pub fn rank(&self) -> Rank {
        self.comp.rank
    }
}

/// A fault domain in the built tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub comp: Component,
    pub nodes: Vec<Node>,
}

/// The versioned pool topology tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMap {
    version: u32,
    domains: Vec<Domain>,
}

impl PoolMap {
    /// Builds a pool map from a packed buffer. Fails with `Inval` when the
    /// buffer violates the declared ordering or the parent/child accounting:
    /// domain child counts must add up to the node count, node stream counts
    /// to the target count, every target's rank must name a node, and target
    /// ids must be unique.
    pub fn build(buf: &PoolBuf, version: u32) -> Result<PoolMap, PoolError> {
        let mut comps = buf.components().iter();

        let mut domains: Vec<Domain> = Vec::with_capacity(buf.domain_count() as usize);
        for _ in 0..buf.domain_count() {
            let comp = *comps.next().ok_or_else(|| short_buf("domain"))?;
            if comp.kind != ComponentKind::Domain {
                return Err(PoolError::Inval(format!(
                    "expected domain component, found {}",
                    comp.kind
                )));
            }
            domains.push(Domain {
                comp,
                nodes: Vec::with_capacity(comp.nr as usize),
            });
        }

        let mut domain_idx = 0usize;
        for _ in 0..buf.node_count() {
            let comp = *comps.next().ok_or_else(|| short_buf("node"))?;
            if comp.kind != ComponentKind::Node {
                return Err(PoolError::Inval(format!(
                    "expected node component, found {}",
                    comp.kind
                )));
            }
            // Nodes fill domains in declared order, comp.nr nodes apiece.
            while domain_idx < domains.len()
                && domains[domain_idx].nodes.len() == domains[domain_idx].comp.nr as usize
            {
                domain_idx += 1;
            }
            let domain = domains
                .get_mut(domain_idx)
                .ok_or_else(|| PoolError::Inval("node without a parent domain".into()))?;
            domain.nodes.push(Node {
                comp,
                targets: Vec::with_capacity(comp.nr as usize),
            });
        }
        if domains.iter().any(|d| d.nodes.len() != d.comp.nr as usize) {
            return Err(PoolError::Inval(
                "domain child counts do not match the node count".into(),
            ));
        }

        let mut seen_ids: HashSet<TargetId> = HashSet::with_capacity(buf.target_count() as usize);
        for _ in 0..buf.target_count() {
            let comp = *comps.next().ok_or_else(|| short_buf("target"))?;
            if comp.kind != ComponentKind::Target {
                return Err(PoolError::Inval(format!(
                    "expected target component, found {}",
                    comp.kind
                )));
            }
            if !seen_ids.insert(comp.id) {
                return Err(PoolError::Inval(format!("duplicate target id {}", comp.id)));
            }
            let node = domains
                .iter_mut()
                .flat_map(|d| d.nodes.iter_mut())
                .find(|n| n.comp.rank == comp.rank && n.targets.len() < n.comp.nr as usize)
                .ok_or_else(|| {
                    PoolError::Inval(format!("target {} has no parent node", comp.id))
                })?;
            node.targets.push(Target { comp });
        }
        if comps.next().is_some() {
            return Err(PoolError::Inval("trailing components in buffer".into()));
        }
        if domains
            .iter()
            .flat_map(|d| d.nodes.iter())
            .any(|n| n.targets.len() != n.comp.nr as usize)
        {
            return Err(PoolError::Inval(
                "node stream counts do not match the target count".into(),
            ));
        }

        Ok(PoolMap { version, domains })
    }

    /// The current map version.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.domains.iter().flat_map(|d| d.nodes.iter())
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.nodes().flat_map(|n| n.targets.iter())
    }

    pub fn target_count(&self) -> usize {
        self.nodes().map(|n| n.targets.len()).sum()
    }

    /// All ranks present in the map, in declared node order.
    pub fn ranks(&self) -> Vec<Rank> {
        self.nodes().map(|n| n.comp.rank).collect()
    }

    /// Finds the targets addressed by `(rank, index)`. Zero matches means the
    /// address names nothing in this map; the caller decides whether that is
    /// an error.
    pub fn find_targets(&self, rank: Rank, index: u32) -> Vec<Target> {
        self.nodes()
            .filter(|n| n.comp.rank == rank)
            .flat_map(|n| n.targets.iter())
            .filter(|t| t.comp.index == index)
            .copied()
            .collect()
    }

    /// Finds one target by its globally unique id.
    pub fn find_target_by_id(&self, id: TargetId) -> Option<Target> {
        self.targets().find(|t| t.comp.id == id).copied()
    }

    /// Extracts the packed buffer for this map, components in declared order.
    pub fn extract_buf(&self) -> PoolBuf {
        let mut buf = PoolBuf::new();
        for domain in &self.domains {
            buf.attach(domain.comp);
        }
        for node in self.nodes() {
            buf.attach(node.comp);
        }
        for domain in &self.domains {
            for node in &domain.nodes {
                for target in &node.targets {
                    buf.attach(target.comp);
                }
            }
        }
        buf
    }

    pub(crate) fn domains_mut(&mut self) -> &mut Vec<Domain> {
        &mut self.domains
    }

    pub(crate) fn set_version(&mut self, version: u32) {
        debug_assert!(version >= self.version);
        self.version = version;
    }
}

fn short_buf(kind: &str) -> PoolError {
    PoolError::Inval(format!("buffer ends before the declared {kind} count"))
}
