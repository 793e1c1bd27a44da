// src/core/broadcast.rs

//! Pushes committed pool maps outward: lazily through the IV namespace to
//! every target server, and over bulk to the client that asked for the map.

use crate::core::PoolError;
use crate::core::bulk::RemoteBulk;
use crate::core::fabric::{IvNamespace, IvShortcut, IvSync};
use crate::core::pool_map::{PoolBuf, Rank, buffer_size};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// One IV entry carrying a committed pool map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDistEntry {
    pub master_rank: Rank,
    pub pool: Uuid,
    pub version: u32,
    pub map: Bytes,
}

/// Publishes the committed map through the pool's IV namespace with lazy
/// synchronization. Receivers that no longer hold the namespace (the pool may
/// be disconnected there) are tolerated.
pub async fn broadcast_map(
    ns: &Arc<dyn IvNamespace>,
    master_rank: Rank,
    pool: Uuid,
    version: u32,
    buf: &PoolBuf,
) -> Result<(), PoolError> {
    debug!(%pool, version, nr = buf.nr(), "broadcasting pool map");
    let entry = MapDistEntry {
        master_rank,
        pool,
        version,
        map: buf.encode(),
    };
    match ns.publish(entry, IvShortcut::None, IvSync::Lazy).await {
        Err(PoolError::Nonexist) => Ok(()),
        other => other,
    }
}

/// Transfers the pool map buffer to the client's bulk buffer in a single
/// IOV put. When the buffer is too small the caller gets `Truncated` with the
/// exact size to retry with, and nothing is transferred.
pub async fn transfer_map(buf: &PoolBuf, remote: &dyn RemoteBulk) -> Result<(), PoolError> {
    let required = buffer_size(buf.nr());
    if remote.len() < required {
        return Err(PoolError::Truncated { required });
    }
    remote.put(0, &buf.encode()).await
}
