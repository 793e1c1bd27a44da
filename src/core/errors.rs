// src/core/errors.rs

//! Defines the primary error type for the entire pool service.

use crate::core::rdb::LeaderHint;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the pool
/// service. Using `thiserror` allows for clean error definitions and automatic
/// `From` trait implementations.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Invalid argument: {0}")]
    Inval(String),

    #[error("Protocol violation: {0}")]
    Proto(String),

    #[error("Permission denied")]
    NoPerm,

    #[error("No such pool handle")]
    NoHandle,

    #[error("Pool is busy")]
    Busy,

    #[error("Entry already exists")]
    Exist,

    #[error("Entry does not exist")]
    Nonexist,

    /// The remote buffer is too small; carries the size that would fit.
    #[error("Buffer truncated; {required} bytes required")]
    Truncated { required: usize },

    #[error("Out of memory")]
    Nomem,

    /// A target fan-out failed on at least one server.
    #[error("Target IO error: {0}")]
    TargetIo(String),

    /// This replica is not (or no longer) the service leader. The hint, when
    /// valid, tells the client where to retry.
    #[error("Not the service leader")]
    NotLeader { hint: LeaderHint },

    #[error("Operation canceled")]
    Canceled,

    #[error("Try again")]
    Again,

    /// The replicated DB exists but holds no pool metadata yet. This is a
    /// typed condition rather than a sentinel error code: only the schema
    /// layer produces it, and only step-up and CREATE consume it.
    #[error("Pool metadata not initialized")]
    Uninit,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for PoolError {
    fn clone(&self) -> Self {
        match self {
            PoolError::Io(e) => PoolError::Io(Arc::clone(e)),
            PoolError::Inval(s) => PoolError::Inval(s.clone()),
            PoolError::Proto(s) => PoolError::Proto(s.clone()),
            PoolError::NoPerm => PoolError::NoPerm,
            PoolError::NoHandle => PoolError::NoHandle,
            PoolError::Busy => PoolError::Busy,
            PoolError::Exist => PoolError::Exist,
            PoolError::Nonexist => PoolError::Nonexist,
            PoolError::Truncated { required } => PoolError::Truncated {
                required: *required,
            },
            PoolError::Nomem => PoolError::Nomem,
            PoolError::TargetIo(s) => PoolError::TargetIo(s.clone()),
            PoolError::NotLeader { hint } => PoolError::NotLeader { hint: *hint },
            PoolError::Canceled => PoolError::Canceled,
            PoolError::Again => PoolError::Again,
            PoolError::Uninit => PoolError::Uninit,
            PoolError::Codec(s) => PoolError::Codec(s.clone()),
            PoolError::Internal(s) => PoolError::Internal(s.clone()),
        }
    }
}

impl PartialEq for PoolError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PoolError::Io(e1), PoolError::Io(e2)) => e1.to_string() == e2.to_string(),
            (PoolError::Inval(s1), PoolError::Inval(s2)) => s1 == s2,
            (PoolError::Proto(s1), PoolError::Proto(s2)) => s1 == s2,
            (PoolError::Truncated { required: r1 }, PoolError::Truncated { required: r2 }) => {
                r1 == r2
            }
            (PoolError::TargetIo(s1), PoolError::TargetIo(s2)) => s1 == s2,
            (PoolError::NotLeader { hint: h1 }, PoolError::NotLeader { hint: h2 }) => h1 == h2,
            (PoolError::Codec(s1), PoolError::Codec(s2)) => s1 == s2,
            (PoolError::Internal(s1), PoolError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::Io(Arc::new(e))
    }
}

impl From<uuid::Error> for PoolError {
    fn from(e: uuid::Error) -> Self {
        PoolError::Inval(format!("malformed UUID: {e}"))
    }
}

impl From<bincode::error::EncodeError> for PoolError {
    fn from(e: bincode::error::EncodeError) -> Self {
        PoolError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for PoolError {
    fn from(e: bincode::error::DecodeError) -> Self {
        PoolError::Codec(e.to_string())
    }
}

impl From<std::str::Utf8Error> for PoolError {
    fn from(e: std::str::Utf8Error) -> Self {
        PoolError::Codec(e.to_string())
    }
}
