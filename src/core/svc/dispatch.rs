// src/core/svc/dispatch.rs

//! Drives one decoded request through its handler and assembles the reply:
//! bulk buffers are materialized from the wire fields, the handler runs, and
//! the reply embeds the result code, the latest leader hint, and the cached
//! map version.

use super::PoolModule;
use super::connect::{ConnectArgs, pool_connect};
use super::create::{CreateArgs, pool_create};
use super::disconnect::{pool_disconnect, pool_evict};
use super::query::pool_query;
use super::replicas::{pool_replicas_add, pool_replicas_remove, pool_svc_stop_handler};
use super::update::pool_update;
use super::attrs::{pool_attr_get, pool_attr_list, pool_attr_set};
use crate::core::PoolError;
use crate::core::bulk::{LocalBulk, RemoteBulk};
use crate::core::client::ReplicaTransport;
use crate::core::handles::PoolCaps;
use crate::core::metrics;
use crate::core::pool_map::Rank;
use crate::core::protocol::{OpReply, PoolReply, PoolRequest, WireRc};
use crate::core::rdb::LeaderHint;
use crate::core::rebuild::RebuildStatus;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

impl PoolModule {
    /// Handles one request end to end.
    pub async fn handle(&self, request: PoolRequest) -> PoolReply {
        let pool = request.pool();
        let op_name = request.op_name();
        metrics::RPCS_TOTAL.with_label_values(&[op_name]).inc();
        debug!(%pool, op = op_name, "dispatching");

        let reply = self.dispatch(request).await;
        debug!(%pool, op = op_name, rc = ?reply.op().rc, "replying");
        reply
    }

    /// A reply header for `pool`, preferring the hint attached to a
    /// `NotLeader` error over whatever the registry can see now.
    async fn op_reply(&self, pool: Uuid, err: Option<&PoolError>) -> OpReply {
        let rc = err.map_or(WireRc::Ok, WireRc::from);
        let hint = match err {
            Some(PoolError::NotLeader { hint }) => *hint,
            _ => self.registry.peek_hint(pool).unwrap_or(LeaderHint::default()),
        };
        OpReply {
            rc,
            hint,
            map_version: self.registry.peek_map_version(pool).await,
        }
    }

    async fn dispatch(&self, request: PoolRequest) -> PoolReply {
        let pool = request.pool();
        match request {
            PoolRequest::Create {
                pool: _,
                uid,
                gid,
                mode,
                target_uuids,
                target_ranks,
                domains,
            } => {
                let result = pool_create(
                    self,
                    CreateArgs {
                        pool,
                        uid,
                        gid,
                        mode,
                        target_uuids: target_uuids.into_iter().map(Into::into).collect(),
                        target_ranks,
                        domains,
                    },
                )
                .await;
                PoolReply::Create {
                    op: self.op_reply(pool, result.err().as_ref()).await,
                }
            }

            PoolRequest::Connect {
                op,
                uid,
                gid,
                capas,
                map_bulk_size,
            } => {
                let Some(capas) = PoolCaps::from_bits(capas) else {
                    let err = PoolError::Inval(format!("unknown capability bits {capas:#x}"));
                    return PoolReply::Connect {
                        op: self.op_reply(pool, Some(&err)).await,
                        uid: 0,
                        gid: 0,
                        mode: 0,
                        rebuild: RebuildStatus::default(),
                        map_payload: Vec::new(),
                        required_map_size: 0,
                    };
                };
                let bulk = LocalBulk::new(map_bulk_size as usize);
                let result = pool_connect(
                    self,
                    ConnectArgs {
                        pool,
                        handle: op.handle.into(),
                        uid,
                        gid,
                        capas,
                        map_bulk: bulk.clone(),
                    },
                )
                .await;
                match result {
                    Ok(out) => PoolReply::Connect {
                        op: self.op_reply(pool, None).await,
                        uid: out.uid,
                        gid: out.gid,
                        mode: out.mode,
                        rebuild: out.rebuild,
                        map_payload: bulk.contents().to_vec(),
                        required_map_size: 0,
                    },
                    Err(e) => PoolReply::Connect {
                        op: self.op_reply(pool, Some(&e)).await,
                        uid: 0,
                        gid: 0,
                        mode: 0,
                        rebuild: RebuildStatus::default(),
                        map_payload: Vec::new(),
                        required_map_size: match e {
                            PoolError::Truncated { required } => required as u64,
                            _ => 0,
                        },
                    },
                }
            }

            PoolRequest::Disconnect { op } => {
                let result = pool_disconnect(self, pool, op.handle.into()).await;
                PoolReply::Disconnect {
                    op: self.op_reply(pool, result.err().as_ref()).await,
                }
            }

            PoolRequest::Query { op, map_bulk_size } => {
                let bulk = LocalBulk::new(map_bulk_size as usize);
                let result = pool_query(self, pool, op.handle.into(), bulk.clone()).await;
                match result {
                    Ok(out) => PoolReply::Query {
                        op: self.op_reply(pool, None).await,
                        uid: out.uid,
                        gid: out.gid,
                        mode: out.mode,
                        rebuild: out.rebuild,
                        map_payload: bulk.contents().to_vec(),
                        required_map_size: 0,
                    },
                    Err(e) => PoolReply::Query {
                        op: self.op_reply(pool, Some(&e)).await,
                        uid: 0,
                        gid: 0,
                        mode: 0,
                        rebuild: RebuildStatus::default(),
                        map_payload: Vec::new(),
                        required_map_size: match e {
                            PoolError::Truncated { required } => required as u64,
                            _ => 0,
                        },
                    },
                }
            }

            PoolRequest::Update { op: _, opcode, addrs } => {
                let result = pool_update(self, pool, addrs, opcode).await;
                match result {
                    Ok(out) => PoolReply::Update {
                        op: self.op_reply(pool, None).await,
                        failed: out.failed,
                    },
                    Err(e) => PoolReply::Update {
                        op: self.op_reply(pool, Some(&e)).await,
                        failed: Vec::new(),
                    },
                }
            }

            PoolRequest::Evict { op: _ } => {
                let result = pool_evict(self, pool).await;
                PoolReply::Evict {
                    op: self.op_reply(pool, result.err().as_ref()).await,
                }
            }

            PoolRequest::Stop { op: _ } => {
                let result = pool_svc_stop_handler(self, pool).await;
                PoolReply::Stop {
                    op: self.op_reply(pool, result.err().as_ref()).await,
                }
            }

            PoolRequest::AttrSet { op: _, count, payload } => {
                let bulk = LocalBulk::with_payload(Bytes::from(payload));
                let result = pool_attr_set(self, pool, count as usize, bulk).await;
                PoolReply::AttrSet {
                    op: self.op_reply(pool, result.err().as_ref()).await,
                }
            }

            PoolRequest::AttrGet {
                op: _,
                count,
                key_length,
                payload,
                bulk_size,
            } => {
                // The client registers one buffer: its input at the front,
                // room for the reply sizes and values behind it.
                let bulk = LocalBulk::new((bulk_size as usize).max(payload.len()));
                let seed = bulk.put(0, &payload).await;
                let result = match seed {
                    Ok(()) => {
                        pool_attr_get(self, pool, count as usize, key_length as usize, bulk.clone())
                            .await
                    }
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => PoolReply::AttrGet {
                        op: self.op_reply(pool, None).await,
                        payload: bulk.contents().to_vec(),
                    },
                    Err(e) => PoolReply::AttrGet {
                        op: self.op_reply(pool, Some(&e)).await,
                        payload: Vec::new(),
                    },
                }
            }

            PoolRequest::AttrList { op: _, bulk_size } => {
                let bulk = bulk_size.map(|size| LocalBulk::new(size as usize));
                let result = pool_attr_list(
                    self,
                    pool,
                    bulk.clone().map(|b| b as Arc<dyn crate::core::bulk::RemoteBulk>),
                )
                .await;
                match result {
                    Ok(total_size) => PoolReply::AttrList {
                        op: self.op_reply(pool, None).await,
                        total_size,
                        payload: bulk.map(|b| b.contents().to_vec()).unwrap_or_default(),
                    },
                    Err(e) => PoolReply::AttrList {
                        op: self.op_reply(pool, Some(&e)).await,
                        total_size: 0,
                        payload: Vec::new(),
                    },
                }
            }

            PoolRequest::ReplicasAdd { op: _, ranks } => {
                let result = pool_replicas_add(self, pool, ranks.clone()).await;
                match result {
                    Ok(failed_ranks) => PoolReply::ReplicasAdd {
                        op: self.op_reply(pool, None).await,
                        failed_ranks,
                    },
                    Err(e) => PoolReply::ReplicasAdd {
                        op: self.op_reply(pool, Some(&e)).await,
                        failed_ranks: ranks,
                    },
                }
            }

            PoolRequest::ReplicasRemove { op: _, ranks } => {
                let result = pool_replicas_remove(self, pool, ranks.clone()).await;
                match result {
                    Ok(failed_ranks) => PoolReply::ReplicasRemove {
                        op: self.op_reply(pool, None).await,
                        failed_ranks,
                    },
                    Err(e) => PoolReply::ReplicasRemove {
                        op: self.op_reply(pool, Some(&e)).await,
                        failed_ranks: ranks,
                    },
                }
            }
        }
    }
}

/// A loopback transport: delivers requests straight into a module, whatever
/// the rank. Used by single-node deployments and the tests.
pub struct LoopbackTransport {
    module: Arc<PoolModule>,
}

impl LoopbackTransport {
    pub fn new(module: Arc<PoolModule>) -> LoopbackTransport {
        LoopbackTransport { module }
    }
}

#[async_trait]
impl ReplicaTransport for LoopbackTransport {
    async fn send(&self, _rank: Rank, request: PoolRequest) -> Result<PoolReply, PoolError> {
        Ok(self.module.handle(request).await)
    }
}
