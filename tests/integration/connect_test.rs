// tests/integration/connect_test.rs

//! Handle admission: connect, reconnect, exclusive opens, disconnect, evict,
//! query verification, and the truncated map transfer.

use super::test_helpers::{GID, MAP_BULK, TestContext, UID, assert_handle_integrity};
use peridot::core::handles::{PoolCaps, REBUILD_HANDLE};
use peridot::core::pool_map::buffer_size;
use peridot::core::protocol::{PoolReply, WireRc};
use std::sync::atomic::Ordering;
use uuid::Uuid;

/// One domain, three nodes, one stream each.
const MAP_COMPONENTS: usize = 1 + 3 + 3;

#[tokio::test]
async fn connect_admits_a_handle_and_transfers_the_map() {
    let ctx = TestContext::created().await;
    let h1 = Uuid::new_v4();

    let reply = ctx.connect(h1, PoolCaps::RO | PoolCaps::RW).await;
    let PoolReply::Connect {
        op,
        uid,
        gid,
        mode,
        map_payload,
        ..
    } = reply
    else {
        panic!("wrong reply variant");
    };
    assert_eq!(op.rc, WireRc::Ok);
    assert_eq!(op.map_version, 1);
    assert_eq!((uid, gid), (UID, GID));
    assert_eq!(mode, super::test_helpers::MODE);
    assert_eq!(map_payload.len(), buffer_size(MAP_COMPONENTS));

    assert_eq!(ctx.nhandles().await, 1);
    assert_handle_integrity(&ctx).await;

    // The admission was announced to every target server.
    let connects = ctx.fabric.targets.connects();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].handle, h1);
    assert_eq!(connects[0].map_version, 1);
}

#[tokio::test]
async fn reconnect_with_same_capas_skips_the_update() {
    let ctx = TestContext::created().await;
    let h1 = Uuid::new_v4();

    assert_eq!(ctx.connect(h1, PoolCaps::RW).await.op().rc, WireRc::Ok);
    let reply = ctx.connect(h1, PoolCaps::RW).await;
    assert_eq!(reply.op().rc, WireRc::Ok);

    // No second admission: the counter stays put and no new target
    // broadcast went out.
    assert_eq!(ctx.nhandles().await, 1);
    assert_eq!(ctx.fabric.targets.connects().len(), 1);

    // The map still came back.
    let PoolReply::Connect { map_payload, .. } = reply else {
        panic!("wrong reply variant");
    };
    assert_eq!(map_payload.len(), buffer_size(MAP_COMPONENTS));
}

#[tokio::test]
async fn reconnect_with_different_capas_is_exist() {
    let ctx = TestContext::created().await;
    let h1 = Uuid::new_v4();

    assert_eq!(ctx.connect(h1, PoolCaps::RW).await.op().rc, WireRc::Ok);
    let reply = ctx.connect(h1, PoolCaps::RO).await;
    assert_eq!(reply.op().rc, WireRc::Exist);
    assert_eq!(ctx.nhandles().await, 1);
}

#[tokio::test]
async fn exclusive_contention() {
    let ctx = TestContext::created().await;
    let h1 = Uuid::new_v4();
    let h2 = Uuid::new_v4();
    let h3 = Uuid::new_v4();

    assert_eq!(ctx.connect(h1, PoolCaps::RW).await.op().rc, WireRc::Ok);

    // Exclusive is refused while any handle is open.
    assert_eq!(ctx.connect(h2, PoolCaps::EX).await.op().rc, WireRc::Busy);

    assert_eq!(ctx.disconnect(h1).await.op().rc, WireRc::Ok);
    assert_eq!(ctx.connect(h2, PoolCaps::EX).await.op().rc, WireRc::Ok);
    assert_eq!(ctx.nhandles().await, 1);

    // And an exclusive holder blocks everyone else.
    assert_eq!(ctx.connect(h3, PoolCaps::RW).await.op().rc, WireRc::Busy);
    assert_handle_integrity(&ctx).await;
}

#[tokio::test]
async fn permission_check_uses_the_matching_triplet() {
    let ctx = TestContext::new().await;
    // User may read and write; group read; others nothing.
    let mode = (0b011 << 6) | (0b001 << 3);
    let reply = ctx
        .module
        .handle(peridot::core::protocol::PoolRequest::Create {
            pool: ctx.pool.into(),
            uid: UID,
            gid: GID,
            mode,
            target_uuids: vec![
                Uuid::new_v4().into(),
                Uuid::new_v4().into(),
                Uuid::new_v4().into(),
            ],
            target_ranks: vec![1, 2, 3],
            domains: vec![3],
        })
        .await;
    assert_eq!(reply.op().rc, WireRc::Ok);

    // The owner may write.
    let reply = ctx
        .connect_as(Uuid::new_v4(), UID, GID, PoolCaps::RW, MAP_BULK)
        .await;
    assert_eq!(reply.op().rc, WireRc::Ok);

    // A group member may not.
    let reply = ctx
        .connect_as(Uuid::new_v4(), 2000, GID, PoolCaps::RW, MAP_BULK)
        .await;
    assert_eq!(reply.op().rc, WireRc::NoPerm);

    // A stranger may not even read.
    let reply = ctx
        .connect_as(Uuid::new_v4(), 2000, 2000, PoolCaps::RO, MAP_BULK)
        .await;
    assert_eq!(reply.op().rc, WireRc::NoPerm);

    assert_eq!(ctx.nhandles().await, 1);
}

#[tokio::test]
async fn truncated_map_bulk_reports_required_size() {
    let ctx = TestContext::created().await;
    let h1 = Uuid::new_v4();

    let reply = ctx.connect_as(h1, UID, GID, PoolCaps::RW, 1).await;
    let PoolReply::Connect {
        op,
        required_map_size,
        ..
    } = reply
    else {
        panic!("wrong reply variant");
    };
    assert_eq!(op.rc, WireRc::Trunc);
    assert_eq!(required_map_size as usize, buffer_size(MAP_COMPONENTS));

    // No metadata mutation occurred.
    assert_eq!(ctx.nhandles().await, 0);
    assert_eq!(ctx.handle_key_count().await, 0);
    assert!(ctx.fabric.targets.connects().is_empty());

    // Retrying with the reported size succeeds.
    let reply = ctx
        .connect_as(h1, UID, GID, PoolCaps::RW, required_map_size)
        .await;
    assert_eq!(reply.op().rc, WireRc::Ok);
}

#[tokio::test]
async fn target_broadcast_failure_aborts_the_admission() {
    let ctx = TestContext::created().await;
    ctx.fabric.targets.fail_connect.store(true, Ordering::Relaxed);

    let reply = ctx.connect(Uuid::new_v4(), PoolCaps::RW).await;
    assert_eq!(reply.op().rc, WireRc::Io);
    assert_eq!(ctx.nhandles().await, 0);
    assert_eq!(ctx.handle_key_count().await, 0);

    ctx.fabric.targets.fail_connect.store(false, Ordering::Relaxed);
    assert_eq!(ctx.connect(Uuid::new_v4(), PoolCaps::RW).await.op().rc, WireRc::Ok);
}

#[tokio::test]
async fn disconnect_unknown_handle_succeeds_silently() {
    let ctx = TestContext::created().await;
    let reply = ctx.disconnect(Uuid::new_v4()).await;
    assert_eq!(reply.op().rc, WireRc::Ok);
    assert_eq!(ctx.nhandles().await, 0);
}

#[tokio::test]
async fn disconnect_closes_containers_and_notifies_targets() {
    let ctx = TestContext::created().await;
    let h1 = Uuid::new_v4();
    assert_eq!(ctx.connect(h1, PoolCaps::RW).await.op().rc, WireRc::Ok);

    assert_eq!(ctx.disconnect(h1).await.op().rc, WireRc::Ok);
    assert_eq!(ctx.nhandles().await, 0);
    assert_handle_integrity(&ctx).await;

    assert_eq!(ctx.fabric.containers.closed(), vec![(ctx.pool, vec![h1])]);
    assert_eq!(ctx.fabric.targets.disconnects(), vec![(ctx.pool, vec![h1])]);
}

#[tokio::test]
async fn evict_closes_every_handle_in_one_transaction() {
    let ctx = TestContext::created().await;
    let h1 = Uuid::new_v4();
    let h2 = Uuid::new_v4();
    assert_eq!(ctx.connect(h1, PoolCaps::RW).await.op().rc, WireRc::Ok);
    assert_eq!(ctx.connect(h2, PoolCaps::RO).await.op().rc, WireRc::Ok);

    assert_eq!(ctx.evict().await.op().rc, WireRc::Ok);
    assert_eq!(ctx.nhandles().await, 0);
    assert_eq!(ctx.handle_key_count().await, 0);
    assert_handle_integrity(&ctx).await;

    // One batched disconnect covering both handles, in key order.
    let disconnects = ctx.fabric.targets.disconnects();
    assert_eq!(disconnects.len(), 1);
    let mut expected = vec![h1, h2];
    expected.sort_by_key(|u| *u.as_bytes());
    assert_eq!(disconnects[0].1, expected);
}

#[tokio::test]
async fn evict_on_an_idle_pool_is_a_noop() {
    let ctx = TestContext::created().await;
    assert_eq!(ctx.evict().await.op().rc, WireRc::Ok);
    assert_eq!(ctx.fabric.targets.disconnects().len(), 0);
}

#[tokio::test]
async fn query_requires_a_known_handle() {
    let ctx = TestContext::created().await;

    let reply = ctx.query(Uuid::new_v4()).await;
    assert_eq!(reply.op().rc, WireRc::NoHdl);

    let h1 = Uuid::new_v4();
    assert_eq!(ctx.connect(h1, PoolCaps::RO).await.op().rc, WireRc::Ok);
    let reply = ctx.query(h1).await;
    let PoolReply::Query {
        op,
        uid,
        gid,
        mode,
        map_payload,
        ..
    } = reply
    else {
        panic!("wrong reply variant");
    };
    assert_eq!(op.rc, WireRc::Ok);
    assert_eq!((uid, gid), (UID, GID));
    assert_eq!(mode, super::test_helpers::MODE);
    assert_eq!(map_payload.len(), buffer_size(MAP_COMPONENTS));
}

#[tokio::test]
async fn rebuild_sentinel_skips_handle_verification() {
    let ctx = TestContext::created().await;
    let reply = ctx.query(REBUILD_HANDLE).await;
    assert_eq!(reply.op().rc, WireRc::Ok);
}
