// src/core/rdb/store.rs

//! The committed KVS forest behind the embedded DB engine: a tree of KVSes
//! whose entries are either plain values or nested KVSes. Iteration order is
//! the key order, which the schema layer relies on for handle enumeration.

use super::{KvsAttr, RdbPath};
use crate::core::PoolError;
use bytes::Bytes;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub enum Entry {
    Value(Bytes),
    Kvs(Kvs),
}

#[derive(Debug, Clone)]
pub struct Kvs {
    pub attr: KvsAttr,
    pub entries: BTreeMap<Bytes, Entry>,
}

impl Kvs {
    pub fn new(attr: KvsAttr) -> Self {
        Self {
            attr,
            entries: BTreeMap::new(),
        }
    }
}

/// The whole committed state of one DB. The root KVS does not exist until a
/// transaction creates it.
#[derive(Debug, Clone, Default)]
pub struct Forest {
    root: Option<Kvs>,
}

impl Forest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_root(&self) -> bool {
        self.root.is_some()
    }

    pub fn create_root(&mut self, attr: KvsAttr) -> Result<(), PoolError> {
        if self.root.is_some() {
            return Err(PoolError::Exist);
        }
        self.root = Some(Kvs::new(attr));
        Ok(())
    }

    /// Resolves `path` to its KVS. A missing root or a missing path segment
    /// is `Nonexist`.
    pub fn resolve(&self, path: &RdbPath) -> Result<&Kvs, PoolError> {
        let mut kvs = self.root.as_ref().ok_or(PoolError::Nonexist)?;
        for segment in path.segments() {
            kvs = match kvs.entries.get(segment) {
                Some(Entry::Kvs(child)) => child,
                Some(Entry::Value(_)) => {
                    return Err(PoolError::Inval(
                        "path segment names a value, not a KVS".into(),
                    ));
                }
                None => return Err(PoolError::Nonexist),
            };
        }
        Ok(kvs)
    }

    pub fn resolve_mut(&mut self, path: &RdbPath) -> Result<&mut Kvs, PoolError> {
        let mut kvs = self.root.as_mut().ok_or(PoolError::Nonexist)?;
        for segment in path.segments() {
            kvs = match kvs.entries.get_mut(segment) {
                Some(Entry::Kvs(child)) => child,
                Some(Entry::Value(_)) => {
                    return Err(PoolError::Inval(
                        "path segment names a value, not a KVS".into(),
                    ));
                }
                None => return Err(PoolError::Nonexist),
            };
        }
        Ok(kvs)
    }

    pub fn lookup(&self, path: &RdbPath, key: &[u8]) -> Result<Bytes, PoolError> {
        match self.resolve(path)?.entries.get(key) {
            Some(Entry::Value(v)) => Ok(v.clone()),
            Some(Entry::Kvs(_)) => Err(PoolError::Inval("key names a KVS, not a value".into())),
            None => Err(PoolError::Nonexist),
        }
    }
}
