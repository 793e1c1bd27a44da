// tests/integration/attr_test.rs

//! User attributes: set, get (with per-value buffer sizes), and list.

use super::test_helpers::{TestContext, MAP_BULK};
use peridot::core::protocol::{PoolReply, PoolRequest, WireRc};
use uuid::Uuid;

/// Builds the SET payload: NUL-terminated names, u64 sizes, values.
fn set_payload(attrs: &[(&str, &[u8])]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (name, _) in attrs {
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
    }
    for (_, value) in attrs {
        payload.extend_from_slice(&(value.len() as u64).to_le_bytes());
    }
    for (_, value) in attrs {
        payload.extend_from_slice(value);
    }
    payload
}

/// Builds the GET input payload: names plus one u64 buffer size per name.
/// Returns `(payload, key_length)`.
fn get_payload(names: &[&str], caps: &[u64]) -> (Vec<u8>, u64) {
    let mut payload = Vec::new();
    for name in names {
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
    }
    let key_length = payload.len() as u64;
    for cap in caps {
        payload.extend_from_slice(&cap.to_le_bytes());
    }
    (payload, key_length)
}

async fn attr_set(ctx: &TestContext, attrs: &[(&str, &[u8])]) -> PoolReply {
    ctx.module
        .handle(PoolRequest::AttrSet {
            op: ctx.op(Uuid::nil()),
            count: attrs.len() as u64,
            payload: set_payload(attrs),
        })
        .await
}

async fn attr_get(ctx: &TestContext, names: &[&str], caps: &[u64]) -> PoolReply {
    let (payload, key_length) = get_payload(names, caps);
    let total: u64 = caps.iter().sum();
    ctx.module
        .handle(PoolRequest::AttrGet {
            op: ctx.op(Uuid::nil()),
            count: names.len() as u64,
            key_length,
            bulk_size: key_length + names.len() as u64 * 8 + total,
            payload,
        })
        .await
}

#[tokio::test]
async fn set_then_get_round_trips() {
    let ctx = TestContext::created().await;
    assert_eq!(
        attr_set(&ctx, &[("alpha", b"hello"), ("beta", b"data")])
            .await
            .op()
            .rc,
        WireRc::Ok
    );

    let reply = attr_get(&ctx, &["alpha", "beta"], &[64, 64]).await;
    let PoolReply::AttrGet { op, payload } = reply else {
        panic!("wrong reply variant");
    };
    assert_eq!(op.rc, WireRc::Ok);

    // The reply overlays the buffer past the names region: actual sizes
    // first, then the concatenated values.
    let key_length = "alpha\0beta\0".len();
    let sizes = &payload[key_length..key_length + 16];
    assert_eq!(u64::from_le_bytes(sizes[..8].try_into().unwrap()), 5);
    assert_eq!(u64::from_le_bytes(sizes[8..].try_into().unwrap()), 4);
    assert_eq!(&payload[key_length + 16..key_length + 16 + 9], b"hellodata");
}

#[tokio::test]
async fn set_overwrites_existing_values() {
    let ctx = TestContext::created().await;
    attr_set(&ctx, &[("alpha", b"one")]).await;
    attr_set(&ctx, &[("alpha", b"twotwo")]).await;

    let reply = attr_get(&ctx, &["alpha"], &[64]).await;
    let PoolReply::AttrGet { payload, .. } = reply else {
        panic!("wrong reply variant");
    };
    let key_length = "alpha\0".len();
    let size = u64::from_le_bytes(payload[key_length..key_length + 8].try_into().unwrap());
    assert_eq!(size, 6);
    assert_eq!(&payload[key_length + 8..key_length + 8 + 6], b"twotwo");
}

#[tokio::test]
async fn zero_size_buffer_asks_for_sizes_only() {
    let ctx = TestContext::created().await;
    attr_set(&ctx, &[("alpha", b"hello")]).await;

    let reply = attr_get(&ctx, &["alpha"], &[0]).await;
    let PoolReply::AttrGet { op, payload } = reply else {
        panic!("wrong reply variant");
    };
    assert_eq!(op.rc, WireRc::Ok);
    let key_length = "alpha\0".len();
    let size = u64::from_le_bytes(payload[key_length..key_length + 8].try_into().unwrap());
    assert_eq!(size, 5);
}

#[tokio::test]
async fn undersized_value_buffer_is_trunc() {
    let ctx = TestContext::created().await;
    attr_set(&ctx, &[("alpha", b"hello")]).await;
    let reply = attr_get(&ctx, &["alpha"], &[2]).await;
    assert_eq!(reply.op().rc, WireRc::Trunc);
}

#[tokio::test]
async fn getting_an_unknown_attribute_is_nonexist() {
    let ctx = TestContext::created().await;
    let reply = attr_get(&ctx, &["missing"], &[64]).await;
    assert_eq!(reply.op().rc, WireRc::Nonexist);
}

#[tokio::test]
async fn list_returns_the_aggregate_name_length() {
    let ctx = TestContext::created().await;
    attr_set(&ctx, &[("alpha", b"x"), ("beta", b"y")]).await;

    // Without a bulk handle only the size comes back.
    let reply = ctx
        .module
        .handle(PoolRequest::AttrList {
            op: ctx.op(Uuid::nil()),
            bulk_size: None,
        })
        .await;
    let PoolReply::AttrList {
        op,
        total_size,
        payload,
    } = reply
    else {
        panic!("wrong reply variant");
    };
    assert_eq!(op.rc, WireRc::Ok);
    assert_eq!(total_size, ("alpha\0".len() + "beta\0".len()) as u64);
    assert!(payload.is_empty());

    // With one, the names land in the buffer in key order.
    let reply = ctx
        .module
        .handle(PoolRequest::AttrList {
            op: ctx.op(Uuid::nil()),
            bulk_size: Some(MAP_BULK),
        })
        .await;
    let PoolReply::AttrList {
        total_size,
        payload,
        ..
    } = reply
    else {
        panic!("wrong reply variant");
    };
    assert_eq!(total_size, 11);
    assert_eq!(&payload[..11], b"alpha\0beta\0");
}

#[tokio::test]
async fn list_transfers_only_names_that_fit() {
    let ctx = TestContext::created().await;
    attr_set(&ctx, &[("alpha", b"x"), ("beta", b"y")]).await;

    // Room for the first name only; the aggregate size still counts both.
    let reply = ctx
        .module
        .handle(PoolRequest::AttrList {
            op: ctx.op(Uuid::nil()),
            bulk_size: Some(8),
        })
        .await;
    let PoolReply::AttrList {
        total_size,
        payload,
        ..
    } = reply
    else {
        panic!("wrong reply variant");
    };
    assert_eq!(total_size, 11);
    assert_eq!(&payload[..6], b"alpha\0");
}
