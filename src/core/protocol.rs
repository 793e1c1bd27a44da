// src/core/protocol.rs

//! The RPC wire contract: every operation carries an op header naming the
//! pool and handle; every reply carries a result code, a leader hint, and
//! the cached map version. Frames are bincode-encoded and length-delimited
//! on the TCP transport.

use crate::core::PoolError;
use crate::core::rdb::LeaderHint;
use crate::core::rebuild::RebuildStatus;
use crate::core::svc::update::TargetAddr;
use crate::core::pool_map::UpdateOp;
use bincode::config;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A UUID as it travels on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode,
    bincode::Decode,
)]
pub struct WireUuid(pub [u8; 16]);

impl From<Uuid> for WireUuid {
    fn from(uuid: Uuid) -> Self {
        WireUuid(*uuid.as_bytes())
    }
}

impl From<WireUuid> for Uuid {
    fn from(wire: WireUuid) -> Self {
        Uuid::from_bytes(wire.0)
    }
}

impl std::fmt::Display for WireUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Uuid::from_bytes(self.0).fmt(f)
    }
}

/// The op header present on every request.
#[derive(Debug, Clone, Copy, bincode::Encode, bincode::Decode)]
pub struct OpHeader {
    pub pool: WireUuid,
    pub handle: WireUuid,
}

/// Result codes on the wire, mirroring the error kinds of [`PoolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum WireRc {
    Ok,
    Inval,
    Proto,
    NoPerm,
    NoHdl,
    Busy,
    Exist,
    Nonexist,
    Trunc,
    Nomem,
    Io,
    NotLeader,
    Canceled,
    Again,
    Uninit,
}

impl WireRc {
    pub fn is_ok(self) -> bool {
        self == WireRc::Ok
    }
}

impl From<&PoolError> for WireRc {
    fn from(e: &PoolError) -> Self {
        match e {
            PoolError::Inval(_) => WireRc::Inval,
            PoolError::Proto(_) => WireRc::Proto,
            PoolError::NoPerm => WireRc::NoPerm,
            PoolError::NoHandle => WireRc::NoHdl,
            PoolError::Busy => WireRc::Busy,
            PoolError::Exist => WireRc::Exist,
            PoolError::Nonexist => WireRc::Nonexist,
            PoolError::Truncated { .. } => WireRc::Trunc,
            PoolError::Nomem => WireRc::Nomem,
            PoolError::Io(_) | PoolError::TargetIo(_) | PoolError::Codec(_) => WireRc::Io,
            PoolError::NotLeader { .. } => WireRc::NotLeader,
            PoolError::Canceled => WireRc::Canceled,
            PoolError::Again => WireRc::Again,
            PoolError::Uninit => WireRc::Uninit,
            PoolError::Internal(_) => WireRc::Io,
        }
    }
}

/// The reply header present on every reply.
#[derive(Debug, Clone, Copy, bincode::Encode, bincode::Decode)]
pub struct OpReply {
    pub rc: WireRc,
    pub hint: LeaderHint,
    pub map_version: u32,
}

impl OpReply {
    pub fn ok(hint: LeaderHint, map_version: u32) -> OpReply {
        OpReply {
            rc: WireRc::Ok,
            hint,
            map_version,
        }
    }
}

/// Every request the pool service understands.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum PoolRequest {
    Create {
        pool: WireUuid,
        uid: u32,
        gid: u32,
        mode: u32,
        target_uuids: Vec<WireUuid>,
        target_ranks: Vec<u32>,
        domains: Vec<u32>,
    },
    Connect {
        op: OpHeader,
        uid: u32,
        gid: u32,
        capas: u64,
        /// Capacity of the client buffer registered for the map transfer.
        map_bulk_size: u64,
    },
    Disconnect {
        op: OpHeader,
    },
    Query {
        op: OpHeader,
        map_bulk_size: u64,
    },
    Update {
        op: OpHeader,
        opcode: UpdateOp,
        addrs: Vec<TargetAddr>,
    },
    Evict {
        op: OpHeader,
    },
    Stop {
        op: OpHeader,
    },
    AttrSet {
        op: OpHeader,
        count: u64,
        payload: Vec<u8>,
    },
    AttrGet {
        op: OpHeader,
        count: u64,
        key_length: u64,
        payload: Vec<u8>,
        bulk_size: u64,
    },
    AttrList {
        op: OpHeader,
        bulk_size: Option<u64>,
    },
    ReplicasAdd {
        op: OpHeader,
        ranks: Vec<u32>,
    },
    ReplicasRemove {
        op: OpHeader,
        ranks: Vec<u32>,
    },
}

impl PoolRequest {
    /// The pool a request addresses.
    pub fn pool(&self) -> Uuid {
        match self {
            PoolRequest::Create { pool, .. } => (*pool).into(),
            PoolRequest::Connect { op, .. }
            | PoolRequest::Disconnect { op }
            | PoolRequest::Query { op, .. }
            | PoolRequest::Update { op, .. }
            | PoolRequest::Evict { op }
            | PoolRequest::Stop { op }
            | PoolRequest::AttrSet { op, .. }
            | PoolRequest::AttrGet { op, .. }
            | PoolRequest::AttrList { op, .. }
            | PoolRequest::ReplicasAdd { op, .. }
            | PoolRequest::ReplicasRemove { op, .. } => op.pool.into(),
        }
    }

    /// The operation name, for logs and metrics.
    pub fn op_name(&self) -> &'static str {
        match self {
            PoolRequest::Create { .. } => "create",
            PoolRequest::Connect { .. } => "connect",
            PoolRequest::Disconnect { .. } => "disconnect",
            PoolRequest::Query { .. } => "query",
            PoolRequest::Update { .. } => "update",
            PoolRequest::Evict { .. } => "evict",
            PoolRequest::Stop { .. } => "stop",
            PoolRequest::AttrSet { .. } => "attr_set",
            PoolRequest::AttrGet { .. } => "attr_get",
            PoolRequest::AttrList { .. } => "attr_list",
            PoolRequest::ReplicasAdd { .. } => "replicas_add",
            PoolRequest::ReplicasRemove { .. } => "replicas_remove",
        }
    }
}

/// Every reply the pool service produces.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum PoolReply {
    Create {
        op: OpReply,
    },
    Connect {
        op: OpReply,
        uid: u32,
        gid: u32,
        mode: u32,
        rebuild: RebuildStatus,
        /// The pool map, inlined by the connection layer on success.
        map_payload: Vec<u8>,
        /// On `Trunc`: the buffer size a retry needs.
        required_map_size: u64,
    },
    Disconnect {
        op: OpReply,
    },
    Query {
        op: OpReply,
        uid: u32,
        gid: u32,
        mode: u32,
        rebuild: RebuildStatus,
        map_payload: Vec<u8>,
        required_map_size: u64,
    },
    Update {
        op: OpReply,
        /// Addresses that resolved to nothing, returned verbatim.
        failed: Vec<TargetAddr>,
    },
    Evict {
        op: OpReply,
    },
    Stop {
        op: OpReply,
    },
    AttrSet {
        op: OpReply,
    },
    AttrGet {
        op: OpReply,
        payload: Vec<u8>,
    },
    AttrList {
        op: OpReply,
        total_size: u64,
        payload: Vec<u8>,
    },
    ReplicasAdd {
        op: OpReply,
        failed_ranks: Vec<u32>,
    },
    ReplicasRemove {
        op: OpReply,
        failed_ranks: Vec<u32>,
    },
}

impl PoolReply {
    /// The reply header.
    pub fn op(&self) -> &OpReply {
        match self {
            PoolReply::Create { op }
            | PoolReply::Connect { op, .. }
            | PoolReply::Disconnect { op }
            | PoolReply::Query { op, .. }
            | PoolReply::Update { op, .. }
            | PoolReply::Evict { op }
            | PoolReply::Stop { op }
            | PoolReply::AttrSet { op }
            | PoolReply::AttrGet { op, .. }
            | PoolReply::AttrList { op, .. }
            | PoolReply::ReplicasAdd { op, .. }
            | PoolReply::ReplicasRemove { op, .. } => op,
        }
    }

    /// Reconstructs a client-side error from a failed reply. The mapping is
    /// lossy in the error detail but keeps the kind and the leader hint,
    /// which is all a retry loop needs.
    pub fn to_error(&self) -> PoolError {
        let op = self.op();
        match op.rc {
            WireRc::Ok => PoolError::Internal("reply carried no error".into()),
            WireRc::Inval => PoolError::Inval("remote: invalid argument".into()),
            WireRc::Proto => PoolError::Proto("remote: protocol violation".into()),
            WireRc::NoPerm => PoolError::NoPerm,
            WireRc::NoHdl => PoolError::NoHandle,
            WireRc::Busy => PoolError::Busy,
            WireRc::Exist => PoolError::Exist,
            WireRc::Nonexist => PoolError::Nonexist,
            WireRc::Trunc => {
                let required = match self {
                    PoolReply::Connect {
                        required_map_size, ..
                    }
                    | PoolReply::Query {
                        required_map_size, ..
                    } => *required_map_size as usize,
                    _ => 0,
                };
                PoolError::Truncated { required }
            }
            WireRc::Nomem => PoolError::Nomem,
            WireRc::Io => PoolError::TargetIo("remote: io error".into()),
            WireRc::NotLeader => PoolError::NotLeader { hint: op.hint },
            WireRc::Canceled => PoolError::Canceled,
            WireRc::Again => PoolError::Again,
            WireRc::Uninit => PoolError::Uninit,
        }
    }
}

/// Encodes one frame body. The transport adds the length prefix.
pub fn encode_frame<T: bincode::Encode>(value: &T) -> Result<Bytes, PoolError> {
    let encoded = bincode::encode_to_vec(value, config::standard())?;
    Ok(Bytes::from(encoded))
}

/// Decodes one frame body.
pub fn decode_frame<T: bincode::Decode<()>>(data: &[u8]) -> Result<T, PoolError> {
    let (value, consumed) = bincode::decode_from_slice(data, config::standard())?;
    if consumed != data.len() {
        return Err(PoolError::Proto(format!(
            "{} trailing bytes after frame",
            data.len() - consumed
        )));
    }
    Ok(value)
}
