// src/core/svc/attrs.rs

//! User attributes: an arbitrary (name -> bytes) KVS per pool. Names travel
//! NUL-terminated inside the bulk payloads and are stored with their
//! terminator, so the listed names concatenate back into a valid payload.

use super::PoolModule;
use crate::core::PoolError;
use crate::core::bulk::RemoteBulk;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Splits `count` NUL-terminated names off the front of `data`, returning
/// the names (terminator included) and the number of bytes consumed.
fn split_names(data: &[u8], count: usize) -> Result<(Vec<&[u8]>, usize), PoolError> {
    let mut names = Vec::with_capacity(count);
    let mut offset = 0usize;
    for _ in 0..count {
        let rest = &data[offset..];
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| PoolError::Proto("unterminated attribute name".into()))?;
        names.push(&rest[..=len]);
        offset += len + 1;
    }
    Ok((names, offset))
}

/// The ATTR_SET handler. The bulk payload is `count` NUL-terminated names,
/// then `count` little-endian u64 sizes, then the concatenated values.
pub async fn pool_attr_set(
    module: &PoolModule,
    pool: Uuid,
    count: usize,
    bulk: Arc<dyn RemoteBulk>,
) -> Result<(), PoolError> {
    debug!(%pool, count, size = bulk.len(), "processing attr set");

    let guard = module.registry.lookup_leader(pool).await?;
    let svc = guard.svc();

    let term = svc.term().await;
    let mut tx = svc.rdb().tx_begin(term);
    let _guard = svc.ps_lock.write().await;

    let data = bulk.get(0, bulk.len()).await?;
    let (names, names_len) = split_names(&data, count)?;

    let mut sizes = &data[names_len..];
    if sizes.len() < count * 8 {
        return Err(PoolError::Proto("attribute size array truncated".into()));
    }
    let mut value_off = names_len + count * 8;
    for name in names {
        let len = sizes.get_u64_le() as usize;
        if value_off + len > data.len() {
            return Err(PoolError::Proto("attribute value truncated".into()));
        }
        let value = data.slice(value_off..value_off + len);
        value_off += len;
        tx.update(svc.user_path(), name, value);
    }
    tx.commit().await
}

/// The ATTR_GET handler. The client payload is the names plus one u64 per
/// attribute giving its receive-buffer size; the reply payload (written back
/// at the end of the names region) is the actual sizes followed by the
/// values. A value bigger than its receive buffer fails with `Truncated`.
pub async fn pool_attr_get(
    module: &PoolModule,
    pool: Uuid,
    count: usize,
    key_length: usize,
    bulk: Arc<dyn RemoteBulk>,
) -> Result<(), PoolError> {
    debug!(%pool, count, key_length, size = bulk.len(), "processing attr get");

    let guard = module.registry.lookup_leader(pool).await?;
    let svc = guard.svc();

    let term = svc.term().await;
    let tx = svc.rdb().tx_begin(term);
    let _guard = svc.ps_lock.read().await;

    let input_size = key_length + count * 8;
    if input_size > bulk.len() {
        return Err(PoolError::Proto("attr get input exceeds bulk".into()));
    }
    let data = bulk.get(0, input_size).await?;
    let (names, names_len) = split_names(&data[..key_length], count)?;
    if names_len != key_length {
        return Err(PoolError::Proto("attribute name region length mismatch".into()));
    }

    let mut caps = &data[key_length..];
    let mut sizes_out = BytesMut::with_capacity(count * 8);
    let mut values = BytesMut::new();
    for name in names {
        let cap = caps.get_u64_le() as usize;
        let value = tx.lookup(svc.user_path(), name).map_err(|e| {
            error!(%pool, error = %e, "failed to look up attribute");
            e
        })?;
        sizes_out.put_u64_le(value.len() as u64);
        // A zero-size buffer asks for the size alone.
        if cap > 0 {
            if value.len() > cap {
                return Err(PoolError::Truncated {
                    required: value.len(),
                });
            }
            values.extend_from_slice(&value);
        }
    }

    let mut reply = BytesMut::with_capacity(sizes_out.len() + values.len());
    reply.extend_from_slice(&sizes_out);
    reply.extend_from_slice(&values);
    bulk.put(key_length, &reply).await
}

/// The ATTR_LIST handler. Returns the aggregate length of all attribute
/// names; when the client supplied a bulk buffer, whole names are also
/// transferred into it, as many as fit.
pub async fn pool_attr_list(
    module: &PoolModule,
    pool: Uuid,
    bulk: Option<Arc<dyn RemoteBulk>>,
) -> Result<u64, PoolError> {
    debug!(%pool, "processing attr list");

    let guard = module.registry.lookup_leader(pool).await?;
    let svc = guard.svc();

    let term = svc.term().await;
    let tx = svc.rdb().tx_begin(term);
    let _guard = svc.ps_lock.read().await;

    let mut available = bulk.as_ref().map_or(0, |b| b.len());
    let mut total = 0u64;
    // The IOV array grows geometrically. Each name is at least two bytes on
    // the wire (one character plus the terminator), so for an N-byte client
    // buffer the array never outgrows N/2 entries.
    let mut iovs: Vec<Bytes> = Vec::with_capacity(1);
    tx.iterate(svc.user_path(), |key, _value| {
        total += key.len() as u64;
        if available > key.len() && !key.is_empty() {
            if iovs.len() == iovs.capacity() {
                iovs.reserve(iovs.capacity());
            }
            iovs.push(Bytes::copy_from_slice(key));
            available -= key.len();
        }
        Ok(())
    })?;

    if !iovs.is_empty() {
        let bulk = bulk.expect("iovs collected only with a bulk present");
        let mut payload = BytesMut::with_capacity(bulk.len() - available);
        for iov in &iovs {
            payload.extend_from_slice(iov);
        }
        bulk.put(0, &payload).await?;
    }

    Ok(total)
}
