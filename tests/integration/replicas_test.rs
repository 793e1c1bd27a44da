// tests/integration/replicas_test.rs

//! Replicated-DB membership changes driven through the RPC surface.

use super::test_helpers::TestContext;
use peridot::core::protocol::{PoolReply, PoolRequest, WireRc};
use uuid::Uuid;

async fn replicas_add(ctx: &TestContext, ranks: Vec<u32>) -> PoolReply {
    ctx.module
        .handle(PoolRequest::ReplicasAdd {
            op: ctx.op(Uuid::nil()),
            ranks,
        })
        .await
}

async fn replicas_remove(ctx: &TestContext, ranks: Vec<u32>) -> PoolReply {
    ctx.module
        .handle(PoolRequest::ReplicasRemove {
            op: ctx.op(Uuid::nil()),
            ranks,
        })
        .await
}

#[tokio::test]
async fn add_starts_and_registers_new_replicas() {
    let ctx = TestContext::created().await;

    let reply = replicas_add(&ctx, vec![5, 6]).await;
    let PoolReply::ReplicasAdd { op, failed_ranks } = reply else {
        panic!("wrong reply variant");
    };
    assert_eq!(op.rc, WireRc::Ok);
    assert!(failed_ranks.is_empty());

    let mut ranks = ctx.svc().rdb().get_ranks();
    ranks.sort_unstable();
    assert_eq!(ranks, vec![ctx.config.self_rank, 5, 6]);

    // The new replicas were started non-bootstrap with the existing DB UUID.
    let started = ctx.fabric.rdb_dist.started();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].0, ctx.svc().rdb().uuid());
    assert_eq!(started[0].2, vec![5, 6]);
}

#[tokio::test]
async fn remove_shrinks_the_membership_and_destroys_files() {
    let ctx = TestContext::created().await;
    assert!(replicas_add(&ctx, vec![5, 6]).await.op().rc.is_ok());

    let reply = replicas_remove(&ctx, vec![5]).await;
    assert_eq!(reply.op().rc, WireRc::Ok);

    let mut ranks = ctx.svc().rdb().get_ranks();
    ranks.sort_unstable();
    assert_eq!(ranks, vec![ctx.config.self_rank, 6]);

    let stopped = ctx.fabric.rdb_dist.stopped();
    assert_eq!(stopped, vec![(ctx.pool, true)]);
}

#[tokio::test]
async fn removing_every_replica_is_refused() {
    let ctx = TestContext::created().await;

    let reply = replicas_remove(&ctx, vec![ctx.config.self_rank]).await;
    let PoolReply::ReplicasRemove { op, failed_ranks } = reply else {
        panic!("wrong reply variant");
    };
    assert_eq!(op.rc, WireRc::Inval);
    assert_eq!(failed_ranks, vec![ctx.config.self_rank]);
    assert_eq!(ctx.svc().rdb().get_ranks(), vec![ctx.config.self_rank]);
}
