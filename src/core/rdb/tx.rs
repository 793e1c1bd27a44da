// src/core/rdb/tx.rs

//! Term-bound KVS transactions.
//!
//! Reads go against the committed forest (with read-your-writes over the
//! transaction's own write set); writes are buffered and applied atomically
//! at commit. Every operation re-checks leadership of the transaction's term,
//! so a service that loses leadership mid-handler fails fast with `NotLeader`
//! instead of committing under a stale term.

use super::store::{Entry, Kvs};
use super::{KvsAttr, Rdb, RdbPath, Term};
use crate::core::PoolError;
use bytes::Bytes;

#[derive(Debug, Clone)]
enum WriteOp {
    CreateRoot {
        attr: KvsAttr,
    },
    CreateKvs {
        path: RdbPath,
        key: Bytes,
        attr: KvsAttr,
    },
    Update {
        path: RdbPath,
        key: Bytes,
        value: Bytes,
    },
    Delete {
        path: RdbPath,
        key: Bytes,
    },
}

/// One transaction against an [`Rdb`].
pub struct RdbTx {
    db: Rdb,
    term: Term,
    writes: Vec<WriteOp>,
}

impl RdbTx {
    pub(super) fn new(db: Rdb, term: Term) -> Self {
        Self {
            db,
            term,
            writes: Vec::new(),
        }
    }

    pub fn term(&self) -> Term {
        self.term
    }

    /// Creates the root KVS. Fails at commit if the root already exists.
    pub fn create_root(&mut self, attr: KvsAttr) {
        self.writes.push(WriteOp::CreateRoot { attr });
    }

    /// Creates an empty sub-KVS under `path`/`key`.
    pub fn create_kvs(&mut self, path: &RdbPath, key: &[u8], attr: KvsAttr) {
        self.writes.push(WriteOp::CreateKvs {
            path: path.clone(),
            key: Bytes::copy_from_slice(key),
            attr,
        });
    }

    /// Inserts or overwrites `key` in the KVS at `path`.
    pub fn update(&mut self, path: &RdbPath, key: &[u8], value: Bytes) {
        self.writes.push(WriteOp::Update {
            path: path.clone(),
            key: Bytes::copy_from_slice(key),
            value,
        });
    }

    /// Deletes `key` from the KVS at `path`. Deleting an absent key fails the
    /// commit with `Nonexist`.
    pub fn delete(&mut self, path: &RdbPath, key: &[u8]) {
        self.writes.push(WriteOp::Delete {
            path: path.clone(),
            key: Bytes::copy_from_slice(key),
        });
    }

    /// Looks up `key` in the KVS at `path`, observing this transaction's own
    /// buffered writes first.
    pub fn lookup(&self, path: &RdbPath, key: &[u8]) -> Result<Bytes, PoolError> {
        self.db.check_leadership(self.term)?;
        for write in self.writes.iter().rev() {
            match write {
                WriteOp::Update {
                    path: p,
                    key: k,
                    value,
                } if p == path && k.as_ref() == key => return Ok(value.clone()),
                WriteOp::Delete { path: p, key: k } if p == path && k.as_ref() == key => {
                    return Err(PoolError::Nonexist);
                }
                _ => {}
            }
        }
        self.db.inner.forest.read().lookup(path, key)
    }

    /// Fetches the first entry (in key order) of the KVS at `path`.
    pub fn probe_first(&self, path: &RdbPath) -> Result<(Bytes, Bytes), PoolError> {
        self.db.check_leadership(self.term)?;
        let forest = self.db.inner.forest.read();
        let kvs = forest.resolve(path)?;
        for (key, entry) in &kvs.entries {
            if let Entry::Value(value) = entry {
                return Ok((key.clone(), value.clone()));
            }
        }
        Err(PoolError::Nonexist)
    }

    /// Iterates the committed entries of the KVS at `path` in key order.
    pub fn iterate(
        &self,
        path: &RdbPath,
        mut f: impl FnMut(&[u8], &[u8]) -> Result<(), PoolError>,
    ) -> Result<(), PoolError> {
        self.db.check_leadership(self.term)?;
        let forest = self.db.inner.forest.read();
        let kvs = forest.resolve(path)?;
        for (key, entry) in &kvs.entries {
            if let Entry::Value(value) = entry {
                f(key, value)?;
            }
        }
        Ok(())
    }

    /// Commits the buffered writes atomically. Rejected with `NotLeader` when
    /// this replica no longer leads the transaction's term: the client gets a
    /// hint and retries against the current leader.
    ///
    /// Commit is a suspension point; a read-only transaction commits as a
    /// no-op.
    pub async fn commit(self) -> Result<(), PoolError> {
        tokio::task::yield_now().await;
        self.db.check_leadership(self.term)?;
        if self.writes.is_empty() {
            return Ok(());
        }

        // Apply against a copy first so a failed commit leaves the committed
        // forest untouched. Values are refcounted, so the copy is shallow.
        let mut forest = self.db.inner.forest.write();
        let mut staged = forest.clone();
        for write in self.writes {
            match write {
                WriteOp::CreateRoot { attr } => staged.create_root(attr)?,
                WriteOp::CreateKvs { path, key, attr } => {
                    let kvs = staged.resolve_mut(&path)?;
                    kvs.entries.entry(key).or_insert(Entry::Kvs(Kvs::new(attr)));
                }
                WriteOp::Update { path, key, value } => {
                    let kvs = staged.resolve_mut(&path)?;
                    kvs.entries.insert(key, Entry::Value(value));
                }
                WriteOp::Delete { path, key } => {
                    let kvs = staged.resolve_mut(&path)?;
                    if kvs.entries.remove(&key).is_none() {
                        return Err(PoolError::Nonexist);
                    }
                }
            }
        }
        *forest = staged;
        Ok(())
    }

    /// Discards the transaction without committing.
    pub fn end(self) {}
}
