// tests/integration/update_test.rs

//! Membership changes: address resolution, version bumps, cache/persistent
//! agreement, map broadcast, and rebuild scheduling.

use super::test_helpers::{TestContext, assert_handle_integrity};
use peridot::core::handles::PoolCaps;
use peridot::core::pool_map::UpdateOp;
use peridot::core::protocol::{PoolReply, PoolRequest, WireRc};
use peridot::core::svc::update::TargetAddr;
use uuid::Uuid;

async fn update(ctx: &TestContext, opcode: UpdateOp, addrs: &[(u32, u32)]) -> PoolReply {
    ctx.module
        .handle(PoolRequest::Update {
            op: ctx.op(Uuid::nil()),
            opcode,
            addrs: addrs
                .iter()
                .map(|(rank, index)| TargetAddr {
                    rank: *rank,
                    index: *index,
                })
                .collect(),
        })
        .await
}

#[tokio::test]
async fn exclude_bumps_the_version_and_schedules_rebuild() {
    let ctx = TestContext::created().await;
    // A client connection creates the IV namespace the broadcast rides on.
    assert_eq!(
        ctx.connect(Uuid::new_v4(), PoolCaps::RW).await.op().rc,
        WireRc::Ok
    );

    let reply = update(&ctx, UpdateOp::Exclude, &[(2, 0)]).await;
    let PoolReply::Update { op, failed } = reply else {
        panic!("wrong reply variant");
    };
    assert_eq!(op.rc, WireRc::Ok);
    assert!(failed.is_empty());
    assert_eq!(op.map_version, 2);

    // Cache and persistent state agree.
    assert_eq!(ctx.svc().cached_version().await, 2);
    assert_eq!(ctx.persisted_map_version().await, 2);

    // The committed map was pushed through the IV namespace.
    let ns = ctx.fabric.iv.namespace(ctx.pool).unwrap();
    let published = ns.published();
    assert_eq!(published.last().unwrap().version, 2);

    // And a rebuild was scheduled over the replica set at commit time.
    let scheduled = ctx.fabric.rebuild.scheduled();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].pool, ctx.pool);
    assert_eq!(scheduled[0].map_version, 2);
    assert_eq!(scheduled[0].excluded.len(), 1);
    assert_eq!(scheduled[0].replicas, vec![ctx.config.self_rank]);
}

#[tokio::test]
async fn repeated_exclude_is_a_noop() {
    let ctx = TestContext::created().await;
    assert_eq!(
        update(&ctx, UpdateOp::Exclude, &[(2, 0)]).await.op().map_version,
        2
    );

    let reply = update(&ctx, UpdateOp::Exclude, &[(2, 0)]).await;
    assert_eq!(reply.op().rc, WireRc::Ok);
    assert_eq!(reply.op().map_version, 2);
    assert_eq!(ctx.persisted_map_version().await, 2);

    // The no-op did not schedule a second rebuild.
    assert_eq!(ctx.fabric.rebuild.scheduled().len(), 1);
}

#[tokio::test]
async fn unresolved_addresses_are_returned_and_the_rest_applied() {
    let ctx = TestContext::created().await;

    let reply = update(&ctx, UpdateOp::Exclude, &[(3, 0), (9, 9)]).await;
    let PoolReply::Update { op, failed } = reply else {
        panic!("wrong reply variant");
    };
    assert_eq!(op.rc, WireRc::Ok);
    assert_eq!(failed, vec![TargetAddr { rank: 9, index: 9 }]);
    assert_eq!(op.map_version, 2);
}

#[tokio::test]
async fn empty_address_list_is_inval() {
    let ctx = TestContext::created().await;
    let reply = update(&ctx, UpdateOp::Exclude, &[]).await;
    assert_eq!(reply.op().rc, WireRc::Inval);
}

#[tokio::test]
async fn add_reactivates_excluded_targets_without_rebuild() {
    let ctx = TestContext::created().await;
    assert_eq!(
        update(&ctx, UpdateOp::Exclude, &[(1, 0)]).await.op().map_version,
        2
    );
    let scheduled_after_exclude = ctx.fabric.rebuild.scheduled().len();

    let reply = update(&ctx, UpdateOp::Add, &[(1, 0)]).await;
    assert_eq!(reply.op().rc, WireRc::Ok);
    assert_eq!(reply.op().map_version, 3);

    // Only exclusions schedule rebuilds.
    assert_eq!(ctx.fabric.rebuild.scheduled().len(), scheduled_after_exclude);
}

#[tokio::test]
async fn exclude_out_only_applies_to_down_targets() {
    let ctx = TestContext::created().await;

    // Not down yet: nothing transitions, version unchanged.
    let reply = update(&ctx, UpdateOp::ExcludeOut, &[(2, 0)]).await;
    assert_eq!(reply.op().map_version, 1);

    update(&ctx, UpdateOp::Exclude, &[(2, 0)]).await;
    let reply = update(&ctx, UpdateOp::ExcludeOut, &[(2, 0)]).await;
    assert_eq!(reply.op().map_version, 3);
}

#[tokio::test]
async fn updates_leave_handles_alone() {
    let ctx = TestContext::created().await;
    assert_eq!(
        ctx.connect(Uuid::new_v4(), PoolCaps::RW).await.op().rc,
        WireRc::Ok
    );
    update(&ctx, UpdateOp::Exclude, &[(1, 0)]).await;
    assert_eq!(ctx.nhandles().await, 1);
    assert_handle_integrity(&ctx).await;
}
