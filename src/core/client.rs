// src/core/client.rs

//! The client side of inter-service calls: a "rechoose" loop that walks the
//! service replicas, guided by the leader hints embedded in replies, until
//! one of them serves the request.

use crate::core::PoolError;
use crate::core::pool_map::Rank;
use crate::core::protocol::{PoolReply, PoolRequest, WireRc};
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Delivers one request to one replica rank.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    async fn send(&self, rank: Rank, request: PoolRequest) -> Result<PoolReply, PoolError>;
}

/// A replicated-service client for one replica set.
pub struct RsvcClient {
    replicas: Vec<Rank>,
    backoff: Duration,
}

/// Attempts before the client gives up on the whole replica set. Each
/// attempt sleeps `backoff`, so the bound also caps the total wait.
const MAX_ATTEMPTS: usize = 64;

impl RsvcClient {
    pub fn new(replicas: Vec<Rank>, backoff: Duration) -> RsvcClient {
        debug_assert!(!replicas.is_empty());
        RsvcClient { replicas, backoff }
    }

    /// Sends `request` until a replica answers with a terminal result.
    ///
    /// Per-replica failures and `NotLeader` replies are retried: the next
    /// target is the hinted rank when the hint is valid and names a known
    /// replica, the next replica in order otherwise, after a short sleep.
    pub async fn send(
        &self,
        transport: &dyn ReplicaTransport,
        request: PoolRequest,
    ) -> Result<PoolReply, PoolError> {
        let mut index = rand::thread_rng().gen_range(0..self.replicas.len());
        let mut last_err = PoolError::Again;

        for attempt in 0..MAX_ATTEMPTS {
            let rank = self.replicas[index];
            match transport.send(rank, request.clone()).await {
                Ok(reply) => {
                    let op = reply.op();
                    if op.rc != WireRc::NotLeader {
                        return Ok(reply);
                    }
                    last_err = reply.to_error();
                    debug!(rank, attempt, "replica is not the leader");
                    index = match op.hint.valid {
                        true => self
                            .replicas
                            .iter()
                            .position(|r| *r == op.hint.rank)
                            .unwrap_or((index + 1) % self.replicas.len()),
                        false => (index + 1) % self.replicas.len(),
                    };
                }
                Err(e) => {
                    debug!(rank, attempt, error = %e, "replica unreachable");
                    last_err = e;
                    index = (index + 1) % self.replicas.len();
                }
            }
            tokio::time::sleep(self.backoff).await;
        }
        Err(last_err)
    }
}
