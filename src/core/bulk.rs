// src/core/bulk.rs

//! The bulk-transfer seam between handlers and the RPC transport.
//!
//! Handlers never see transport details: they are handed a [`RemoteBulk`]
//! describing the client-registered buffer and move bytes with `put`/`get`.
//! Transfers may suspend; QUERY and CONNECT run them while holding the
//! service read lock.

use crate::core::PoolError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// A remote bulk buffer registered by the client for one RPC.
#[async_trait]
pub trait RemoteBulk: Send + Sync {
    /// The registered capacity in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transfers `data` into the remote buffer at `offset`.
    async fn put(&self, offset: usize, data: &[u8]) -> Result<(), PoolError>;

    /// Fetches `len` bytes from the remote buffer at `offset`.
    async fn get(&self, offset: usize, len: usize) -> Result<Bytes, PoolError>;
}

/// An in-process bulk buffer: backs the loopback transport, the connection
/// layer (which inlines bulk contents into reply frames), and the tests.
pub struct LocalBulk {
    capacity: usize,
    buf: Mutex<BytesMut>,
    /// High-water mark of `put` writes; `contents` returns this prefix.
    written: Mutex<usize>,
    gate: Option<Arc<Notify>>,
}

impl LocalBulk {
    /// An empty writable buffer of the given capacity.
    pub fn new(capacity: usize) -> Arc<LocalBulk> {
        Arc::new(LocalBulk {
            capacity,
            buf: Mutex::new(BytesMut::zeroed(capacity)),
            written: Mutex::new(0),
            gate: None,
        })
    }

    /// A buffer pre-filled with a client payload (for SET-style transfers).
    pub fn with_payload(payload: Bytes) -> Arc<LocalBulk> {
        let len = payload.len();
        Arc::new(LocalBulk {
            capacity: len,
            buf: Mutex::new(BytesMut::from(&payload[..])),
            written: Mutex::new(len),
            gate: None,
        })
    }

    /// A writable buffer whose first `put` parks until the returned trigger
    /// is notified. Lets tests freeze a handler inside a bulk transfer.
    pub fn gated(capacity: usize) -> (Arc<LocalBulk>, Arc<Notify>) {
        let trigger = Arc::new(Notify::new());
        let bulk = Arc::new(LocalBulk {
            capacity,
            buf: Mutex::new(BytesMut::zeroed(capacity)),
            written: Mutex::new(0),
            gate: Some(Arc::clone(&trigger)),
        });
        (bulk, trigger)
    }

    /// A snapshot of everything written so far.
    pub fn contents(&self) -> Bytes {
        let written = *self.written.lock();
        Bytes::copy_from_slice(&self.buf.lock()[..written])
    }
}

#[async_trait]
impl RemoteBulk for LocalBulk {
    fn len(&self) -> usize {
        self.capacity
    }

    async fn put(&self, offset: usize, data: &[u8]) -> Result<(), PoolError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let mut buf = self.buf.lock();
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= buf.len())
            .ok_or(PoolError::Truncated {
                required: offset + data.len(),
            })?;
        buf[offset..end].copy_from_slice(data);
        drop(buf);
        let mut written = self.written.lock();
        *written = (*written).max(end);
        Ok(())
    }

    async fn get(&self, offset: usize, len: usize) -> Result<Bytes, PoolError> {
        let buf = self.buf.lock();
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= buf.len())
            .ok_or(PoolError::Truncated {
                required: offset + len,
            })?;
        Ok(Bytes::copy_from_slice(&buf[offset..end]))
    }
}
