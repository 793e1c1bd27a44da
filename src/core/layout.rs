// src/core/layout.rs

//! The metadata schema of one pool inside its replicated DB.
//!
//! Layout, rooted at the pool's root KVS (generic, order 8):
//!
//! ```text
//! root: uid, gid, mode          pool attributes, written once at creation
//!       map_version, map_buffer the committed pool map
//!       map_uuids               sorted target UUID array (16*N bytes)
//!       nhandles                open handle count
//!       handles/                sub-KVS (order 16): handle UUID -> record
//!       user_attrs/             sub-KVS: attribute name -> raw bytes
//! ```

use crate::core::PoolError;
use crate::core::handles::PoolAttrs;
use crate::core::pool_map::{
    Component, ComponentKind, ComponentState, PoolBuf, PoolMap, Rank,
};
use crate::core::rdb::{KvsAttr, KvsClass, RdbPath, RdbTx};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;
use uuid::Uuid;

pub const ATTR_UID: &[u8] = b"uid";
pub const ATTR_GID: &[u8] = b"gid";
pub const ATTR_MODE: &[u8] = b"mode";
pub const ATTR_MAP_VERSION: &[u8] = b"map_version";
pub const ATTR_MAP_BUFFER: &[u8] = b"map_buffer";
pub const ATTR_MAP_UUIDS: &[u8] = b"map_uuids";
pub const ATTR_NHANDLES: &[u8] = b"nhandles";
pub const ATTR_HANDLES: &[u8] = b"handles";
pub const ATTR_USER: &[u8] = b"user_attrs";

/// Attributes of the pool root KVS.
pub const ROOT_KVS_ATTR: KvsAttr = KvsAttr {
    class: KvsClass::Generic,
    order: 8,
};

/// Attributes of the handles and user-attribute sub-KVSes.
pub const SUB_KVS_ATTR: KvsAttr = KvsAttr {
    class: KvsClass::Generic,
    order: 16,
};

fn encode_u32(v: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32_le(v);
    buf.freeze()
}

fn decode_u32(mut data: &[u8]) -> Result<u32, PoolError> {
    if data.len() != 4 {
        return Err(PoolError::Codec(format!(
            "expected a u32 value, found {} bytes",
            data.len()
        )));
    }
    Ok(data.get_u32_le())
}

/// Reads the pool (uid, gid, mode) attributes.
pub fn read_attrs(tx: &RdbTx, root: &RdbPath) -> Result<PoolAttrs, PoolError> {
    let attrs = PoolAttrs {
        uid: decode_u32(&tx.lookup(root, ATTR_UID)?)?,
        gid: decode_u32(&tx.lookup(root, ATTR_GID)?)?,
        mode: decode_u32(&tx.lookup(root, ATTR_MODE)?)?,
    };
    debug!(uid = attrs.uid, gid = attrs.gid, mode = attrs.mode, "read pool attributes");
    Ok(attrs)
}

/// Writes the committed map buffer and version.
pub fn write_map_buf(
    tx: &mut RdbTx,
    root: &RdbPath,
    buf: &PoolBuf,
    version: u32,
) -> Result<(), PoolError> {
    debug!(
        version,
        ntargets = buf.target_count(),
        ndomains = buf.domain_count(),
        "writing pool map"
    );
    tx.update(root, ATTR_MAP_VERSION, encode_u32(version));
    tx.update(root, ATTR_MAP_BUFFER, buf.encode());
    Ok(())
}

/// Reads the committed map buffer and version.
///
/// A missing `map_buffer` means the DB has not been initialized by CREATE
/// yet, which is a typed condition (`Uninit`) distinct from every other
/// missing key: step-up uses it to enter the `UpEmpty` state.
pub fn read_map_buf(tx: &RdbTx, root: &RdbPath) -> Result<(PoolBuf, u32), PoolError> {
    let version = match tx.lookup(root, ATTR_MAP_VERSION) {
        Ok(v) => decode_u32(&v)?,
        Err(PoolError::Nonexist) => return Err(PoolError::Uninit),
        Err(e) => return Err(e),
    };
    let raw = match tx.lookup(root, ATTR_MAP_BUFFER) {
        Ok(v) => v,
        Err(PoolError::Nonexist) => return Err(PoolError::Uninit),
        Err(e) => return Err(e),
    };
    Ok((PoolBuf::decode(&raw)?, version))
}

/// Reads the committed map buffer and builds the topology tree.
pub fn read_map(tx: &RdbTx, root: &RdbPath) -> Result<PoolMap, PoolError> {
    let (buf, version) = read_map_buf(tx, root)?;
    PoolMap::build(&buf, version)
}

pub fn read_nhandles(tx: &RdbTx, root: &RdbPath) -> Result<u32, PoolError> {
    decode_u32(&tx.lookup(root, ATTR_NHANDLES)?)
}

pub fn write_nhandles(tx: &mut RdbTx, root: &RdbPath, nhandles: u32) {
    tx.update(root, ATTR_NHANDLES, encode_u32(nhandles));
}

/// Initializes the full pool metadata schema in one transaction: the initial
/// map (domains, then nodes, then targets, target ids assigned densely in
/// input order), the pool attributes, the sorted UUID array, and the empty
/// handle and user-attribute sub-KVSes.
#[allow(clippy::too_many_arguments)]
pub fn init_pool_metadata(
    tx: &mut RdbTx,
    root: &RdbPath,
    uid: u32,
    gid: u32,
    mode: u32,
    target_uuids: &[Uuid],
    target_ranks: &[Rank],
    domains: &[u32],
    streams_per_node: u32,
) -> Result<(), PoolError> {
    let map_version = 1u32;
    let nnodes = target_uuids.len();

    // A sorted UUID copy determines node ids, mirroring the array persisted
    // under `map_uuids`.
    let mut sorted: Vec<Uuid> = target_uuids.to_vec();
    sorted.sort_unstable();

    let mut map_buf = PoolBuf::new();
    for (i, children) in domains.iter().enumerate() {
        map_buf.attach(Component {
            kind: ComponentKind::Domain,
            status: ComponentState::Up,
            index: i as u32,
            id: i as u32,
            rank: 0,
            ver: map_version,
            fseq: 1,
            nr: *children,
        });
    }
    for (i, uuid) in target_uuids.iter().enumerate() {
        let id = sorted.binary_search(uuid).expect("uuid came from the input") as u32;
        map_buf.attach(Component {
            kind: ComponentKind::Node,
            status: ComponentState::Up,
            index: i as u32,
            id,
            rank: target_ranks[i],
            ver: map_version,
            fseq: 1,
            nr: streams_per_node,
        });
    }
    for i in 0..nnodes {
        for j in 0..streams_per_node {
            map_buf.attach(Component {
                kind: ComponentKind::Target,
                status: ComponentState::Up,
                index: j,
                id: i as u32 * streams_per_node + j,
                rank: target_ranks[i],
                ver: map_version,
                fseq: 1,
                nr: 1,
            });
        }
    }

    tx.update(root, ATTR_UID, encode_u32(uid));
    tx.update(root, ATTR_GID, encode_u32(gid));
    tx.update(root, ATTR_MODE, encode_u32(mode));

    write_map_buf(tx, root, &map_buf, map_version)?;

    let mut uuid_bytes = BytesMut::with_capacity(16 * sorted.len());
    for uuid in &sorted {
        uuid_bytes.put_slice(uuid.as_bytes());
    }
    tx.update(root, ATTR_MAP_UUIDS, uuid_bytes.freeze());

    write_nhandles(tx, root, 0);
    tx.create_kvs(root, ATTR_HANDLES, SUB_KVS_ATTR);
    tx.create_kvs(root, ATTR_USER, SUB_KVS_ATTR);
    Ok(())
}
