// tests/property/roundtrip_test.rs

//! Codec round-trips and map mutation invariants over generated topologies.

use peridot::core::pool_map::{
    Component, ComponentKind, ComponentState, PoolBuf, PoolMap, UpdateOp, buffer_size,
};
use proptest::prelude::*;

/// Shape of a generated topology: nodes per domain, streams per node.
fn topology() -> impl Strategy<Value = (Vec<u32>, u32)> {
    (prop::collection::vec(1u32..4, 1..4), 1u32..4)
}

/// Builds a well-formed pool buffer from a topology shape.
fn make_buf(domains: &[u32], streams: u32) -> PoolBuf {
    let nnodes: u32 = domains.iter().sum();
    let mut buf = PoolBuf::new();
    for (i, nr) in domains.iter().enumerate() {
        buf.attach(Component {
            kind: ComponentKind::Domain,
            status: ComponentState::Up,
            index: i as u32,
            id: i as u32,
            rank: 0,
            ver: 1,
            fseq: 1,
            nr: *nr,
        });
    }
    for i in 0..nnodes {
        buf.attach(Component {
            kind: ComponentKind::Node,
            status: ComponentState::Up,
            index: i,
            id: i,
            rank: i + 1,
            ver: 1,
            fseq: 1,
            nr: streams,
        });
    }
    for i in 0..nnodes {
        for j in 0..streams {
            buf.attach(Component {
                kind: ComponentKind::Target,
                status: ComponentState::Up,
                index: j,
                id: i * streams + j,
                rank: i + 1,
                ver: 1,
                fseq: 1,
                nr: 1,
            });
        }
    }
    buf
}

proptest! {
    /// `decode(encode(buf))` is identical, and the encoded size is exactly
    /// `buffer_size(nr)`.
    #[test]
    fn packed_buffer_round_trips((domains, streams) in topology()) {
        let buf = make_buf(&domains, streams);
        let encoded = buf.encode();
        prop_assert_eq!(encoded.len(), buffer_size(buf.nr()));

        let decoded = PoolBuf::decode(&encoded).unwrap();
        prop_assert_eq!(&decoded, &buf);
        // Byte-for-byte: re-encoding the decoded buffer is the same buffer.
        prop_assert_eq!(decoded.encode(), encoded);
    }

    /// `extract(build(buf))` preserves the packed representation.
    #[test]
    fn build_then_extract_is_identity((domains, streams) in topology()) {
        let buf = make_buf(&domains, streams);
        let map = PoolMap::build(&buf, 1).unwrap();
        prop_assert_eq!(map.extract_buf().encode(), buf.encode());
    }

    /// Versions never decrease and fail sequences only grow, whatever the
    /// operation order.
    #[test]
    fn versions_and_fseqs_are_monotone(
        (domains, streams) in topology(),
        ops in prop::collection::vec((0u32..16, 0usize..4), 0..12),
    ) {
        let buf = make_buf(&domains, streams);
        let mut map = PoolMap::build(&buf, 1).unwrap();
        let mut last_version = map.version();
        let mut last_fseqs: Vec<u32> = map.targets().map(|t| t.comp.fseq).collect();

        for (id, op) in ops {
            let op = [UpdateOp::Exclude, UpdateOp::ExcludeOut, UpdateOp::Add, UpdateOp::AddIn][op];
            let version = map.apply_update(&[id], op);
            prop_assert!(version >= last_version);
            last_version = version;

            let fseqs: Vec<u32> = map.targets().map(|t| t.comp.fseq).collect();
            for (old, new) in last_fseqs.iter().zip(fseqs.iter()) {
                prop_assert!(new >= old);
            }
            last_fseqs = fseqs;
        }
    }

    /// Applying the same operation twice never bumps the version twice.
    #[test]
    fn updates_are_idempotent(
        (domains, streams) in topology(),
        id in 0u32..16,
    ) {
        let buf = make_buf(&domains, streams);
        let mut map = PoolMap::build(&buf, 1).unwrap();
        let first = map.apply_update(&[id], UpdateOp::Exclude);
        let second = map.apply_update(&[id], UpdateOp::Exclude);
        prop_assert_eq!(first, second);
    }
}
