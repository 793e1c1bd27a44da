// src/core/handles.rs

//! Pool handle records, capability bits, and the access check that gates
//! CONNECT.

use crate::core::PoolError;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

bitflags! {
    /// Capability bits requested on a pool handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct PoolCaps: u64 {
        /// Read-only access.
        const RO = 1 << 0;
        /// Read-write access.
        const RW = 1 << 1;
        /// Exclusive open: no other handle may coexist with this one.
        const EX = 1 << 2;
    }
}

/// Width of one capability triplet inside the pool mode word.
pub const CAPA_NBITS: u32 = 3;

/// Mask extracting one capability triplet.
pub const CAPA_MASK: u32 = (1 << CAPA_NBITS) - 1;

/// The well-known handle UUID the rebuild subsystem presents on QUERY.
/// Rebuild never connects, so its queries skip handle verification.
pub const REBUILD_HANDLE: Uuid = Uuid::from_bytes([
    0x72, 0x62, 0x6c, 0x64, 0x00, 0x00, 0x40, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x01,
]);

/// Packs per-user, per-group, and other capability triplets into a mode word.
pub fn mode_pack(user: u32, group: u32, other: u32) -> u32 {
    ((user & CAPA_MASK) << (CAPA_NBITS * 2)) | ((group & CAPA_MASK) << CAPA_NBITS)
        | (other & CAPA_MASK)
}

/// The persisted (uid, gid, mode) triple of a pool, written once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAttrs {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// Whether `capas` are permitted for a caller identified by `(uid, gid)`.
///
/// Precedence is user > group > other: a caller matching the pool uid is
/// judged by the user triplet even if the group triplet would be more
/// generous. All requested bits must be covered.
pub fn permitted(attrs: &PoolAttrs, uid: u32, gid: u32, capas: PoolCaps) -> bool {
    let shift = if uid == attrs.uid {
        CAPA_NBITS * 2 // user
    } else if gid == attrs.gid {
        CAPA_NBITS // group
    } else {
        0 // other
    };

    let capas_permitted = u64::from((attrs.mode >> shift) & CAPA_MASK);
    (capas.bits() & capas_permitted) == capas.bits()
}

/// One record in the handles KVS, keyed by the handle UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHandle {
    pub capas: PoolCaps,
}

impl PoolHandle {
    pub fn is_exclusive(&self) -> bool {
        self.capas.contains(PoolCaps::EX)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64_le(self.capas.bits());
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<PoolHandle, PoolError> {
        if data.len() != 8 {
            return Err(PoolError::Codec(format!(
                "pool handle record has {} bytes, expected 8",
                data.len()
            )));
        }
        let bits = data.get_u64_le();
        let capas = PoolCaps::from_bits(bits)
            .ok_or_else(|| PoolError::Codec(format!("unknown capability bits {bits:#x}")))?;
        Ok(PoolHandle { capas })
    }
}
