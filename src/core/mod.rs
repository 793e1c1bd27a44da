// src/core/mod.rs

//! The central module containing the core logic and data structures of the
//! pool service.

pub mod bootstrap;
pub mod broadcast;
pub mod bulk;
pub mod client;
pub mod errors;
pub mod fabric;
pub mod fault;
pub mod handles;
pub mod layout;
pub mod metrics;
pub mod pool_map;
pub mod protocol;
pub mod rdb;
pub mod rebuild;
pub mod registry;
pub mod svc;

pub use errors::PoolError;
pub use protocol::{PoolReply, PoolRequest};
