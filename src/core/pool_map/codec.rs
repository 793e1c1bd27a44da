// src/core/pool_map/codec.rs

//! The packed wire format of a pool map buffer.
//!
//! The buffer must have an exactly computable size (clients preallocate their
//! receive buffers from `buffer_size`), so components are fixed-width records
//! rather than a varint encoding. A CRC-32 over the body guards the buffer on
//! its way through the replicated DB and the bulk path.

use super::{Component, ComponentKind, ComponentState};
use crate::core::PoolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_32_ISCSI, Crc};

/// `magic (4) + checksum (4) + ndomains (4) + nnodes (4) + ntargets (4)`.
pub const POOL_BUF_HEADER_SIZE: usize = 20;

/// `kind (1) + status (1) + reserved (2)` plus six `u32` fields.
pub const COMPONENT_WIRE_SIZE: usize = 28;

const POOL_BUF_MAGIC: u32 = 0x70_6d_62_31; // "pmb1"

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The exact encoded size of a buffer holding `nr` components.
pub fn buffer_size(nr: usize) -> usize {
    POOL_BUF_HEADER_SIZE + nr * COMPONENT_WIRE_SIZE
}

/// A packed pool map buffer: components in declared order (domains, nodes,
/// targets) plus the per-kind counts from the header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PoolBuf {
    domains: u32,
    nodes: u32,
    targets: u32,
    comps: Vec<Component>,
}

impl PoolBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a component, maintaining the per-kind counts. Components must
    /// be attached in declared order; `PoolMap::build` rejects violations.
    pub fn attach(&mut self, comp: Component) {
        match comp.kind {
            ComponentKind::Domain => self.domains += 1,
            ComponentKind::Node => self.nodes += 1,
            ComponentKind::Target => self.targets += 1,
        }
        self.comps.push(comp);
    }

    pub fn components(&self) -> &[Component] {
        &self.comps
    }

    pub fn nr(&self) -> usize {
        self.comps.len()
    }

    pub fn domain_count(&self) -> u32 {
        self.domains
    }

    pub fn node_count(&self) -> u32 {
        self.nodes
    }

    pub fn target_count(&self) -> u32 {
        self.targets
    }

    /// The exact size `encode` will produce for this buffer.
    pub fn encoded_size(&self) -> usize {
        buffer_size(self.nr())
    }

    /// Encodes the buffer into its packed representation.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(self.encoded_size() - 8);
        body.put_u32_le(self.domains);
        body.put_u32_le(self.nodes);
        body.put_u32_le(self.targets);
        for comp in &self.comps {
            put_component(&mut body, comp);
        }

        let mut out = BytesMut::with_capacity(self.encoded_size());
        out.put_u32_le(POOL_BUF_MAGIC);
        out.put_u32_le(CASTAGNOLI.checksum(&body));
        out.extend_from_slice(&body);
        out.freeze()
    }

    /// Decodes a packed buffer, verifying the magic, the checksum, and that
    /// the component records match the declared counts.
    pub fn decode(data: &[u8]) -> Result<PoolBuf, PoolError> {
        if data.len() < POOL_BUF_HEADER_SIZE {
            return Err(PoolError::Codec(format!(
                "pool buffer too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = data;
        let magic = cursor.get_u32_le();
        if magic != POOL_BUF_MAGIC {
            return Err(PoolError::Codec(format!("bad pool buffer magic {magic:#x}")));
        }
        let checksum = cursor.get_u32_le();
        if checksum != CASTAGNOLI.checksum(cursor) {
            return Err(PoolError::Codec("pool buffer checksum mismatch".into()));
        }

        let domains = cursor.get_u32_le();
        let nodes = cursor.get_u32_le();
        let targets = cursor.get_u32_le();
        let nr = (domains as usize) + (nodes as usize) + (targets as usize);
        if cursor.remaining() != nr * COMPONENT_WIRE_SIZE {
            return Err(PoolError::Codec(format!(
                "pool buffer declares {nr} components but carries {} bytes",
                cursor.remaining()
            )));
        }

        let mut comps = Vec::with_capacity(nr);
        for _ in 0..nr {
            comps.push(get_component(&mut cursor)?);
        }
        Ok(PoolBuf {
            domains,
            nodes,
            targets,
            comps,
        })
    }
}

fn put_component(buf: &mut BytesMut, comp: &Component) {
    buf.put_u8(match comp.kind {
        ComponentKind::Domain => 0,
        ComponentKind::Node => 1,
        ComponentKind::Target => 2,
    });
    buf.put_u8(match comp.status {
        ComponentState::Up => 0,
        ComponentState::UpIn => 1,
        ComponentState::Down => 2,
        ComponentState::DownOut => 3,
        ComponentState::New => 4,
    });
    buf.put_u16_le(0); // reserved
    buf.put_u32_le(comp.index);
    buf.put_u32_le(comp.id);
    buf.put_u32_le(comp.rank);
    buf.put_u32_le(comp.ver);
    buf.put_u32_le(comp.fseq);
    buf.put_u32_le(comp.nr);
}

fn get_component(cursor: &mut &[u8]) -> Result<Component, PoolError> {
    let kind = match cursor.get_u8() {
        0 => ComponentKind::Domain,
        1 => ComponentKind::Node,
        2 => ComponentKind::Target,
        k => return Err(PoolError::Codec(format!("unknown component kind {k}"))),
    };
    let status = match cursor.get_u8() {
        0 => ComponentState::Up,
        1 => ComponentState::UpIn,
        2 => ComponentState::Down,
        3 => ComponentState::DownOut,
        4 => ComponentState::New,
        s => return Err(PoolError::Codec(format!("unknown component status {s}"))),
    };
    cursor.get_u16_le(); // reserved
    Ok(Component {
        kind,
        status,
        index: cursor.get_u32_le(),
        id: cursor.get_u32_le(),
        rank: cursor.get_u32_le(),
        ver: cursor.get_u32_le(),
        fseq: cursor.get_u32_le(),
        nr: cursor.get_u32_le(),
    })
}
