// tests/integration/leadership_test.rs

//! Leadership loss: stale-term rejection, leader hints, and the mid-connect
//! step-down scenario.

use super::test_helpers::{GID, TestContext, UID};
use peridot::core::PoolError;
use peridot::core::bulk::LocalBulk;
use peridot::core::handles::PoolCaps;
use peridot::core::pool_map::buffer_size;
use peridot::core::protocol::WireRc;
use peridot::core::svc::SvcState;
use peridot::core::svc::connect::{ConnectArgs, pool_connect};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn demoted_service_refuses_rpcs_with_a_hint() {
    let ctx = TestContext::created().await;
    ctx.svc().rdb().demote().await;
    assert_eq!(ctx.svc().state().await, SvcState::Down);

    let reply = ctx.connect(Uuid::new_v4(), PoolCaps::RW).await;
    assert_eq!(reply.op().rc, WireRc::NotLeader);
}

#[tokio::test]
async fn a_new_term_serves_again_with_a_consistent_cache() {
    let ctx = TestContext::created().await;
    let term_before = ctx.svc().term().await;

    ctx.svc().rdb().demote().await;
    ctx.svc().rdb().campaign().await;

    let svc = ctx.svc();
    assert_eq!(svc.state().await, SvcState::Up);
    assert!(svc.term().await > term_before);
    // The new leader reloaded the committed map into its cache.
    assert_eq!(svc.cached_version().await, ctx.persisted_map_version().await);

    assert_eq!(
        ctx.connect(Uuid::new_v4(), PoolCaps::RW).await.op().rc,
        WireRc::Ok
    );
}

#[tokio::test]
async fn leader_loss_mid_connect_aborts_before_the_target_broadcast() {
    let ctx = TestContext::created().await;
    let svc = ctx.svc();
    let handle = Uuid::new_v4();

    // Freeze the handler inside its map transfer to the client.
    let (bulk, trigger) = LocalBulk::gated(buffer_size(7));
    let module = Arc::clone(&ctx.module);
    let pool = ctx.pool;
    let connect = tokio::spawn(async move {
        pool_connect(
            &module,
            ConnectArgs {
                pool,
                handle,
                uid: UID,
                gid: GID,
                capas: PoolCaps::RW,
                map_bulk: bulk,
            },
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The step-down drains leader references, so it blocks until the frozen
    // handler observes the loss and unwinds.
    let rdb = svc.rdb().clone();
    let demote = tokio::spawn(async move { rdb.demote().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.notify_one();

    let err = connect.await.unwrap().unwrap_err();
    assert!(matches!(err, PoolError::NotLeader { .. }));
    demote.await.unwrap();

    // The broadcast was never issued and no metadata changed.
    assert!(ctx.fabric.targets.connects().is_empty());

    ctx.svc().rdb().campaign().await;
    assert_eq!(ctx.nhandles().await, 0);
    assert_eq!(ctx.handle_key_count().await, 0);
}
