//! Region handoff: snapshot streaming under a credit window converging
//! with live writes.

use tessera_core::wire::Status;
use tessera_core::{
    Attribute, DataStore, DataType, InstanceId, RegionId, Space, SpaceId, Subspace, TransferId,
    TransferSpec,
};
use tessera_testing::{whole_subspace_config, Cluster};
use tessera_types::int64;

const A: InstanceId = InstanceId(1);
const B: InstanceId = InstanceId(2);
const XFER: TransferId = TransferId(7);

fn kv_space() -> Space {
    Space {
        id: SpaceId(9),
        name: "kv".into(),
        attrs: vec![
            Attribute::new("k", DataType::String),
            Attribute::new("n", DataType::Int64),
        ],
        subspaces: vec![Subspace::new(vec![0])],
        doc_indexes: vec![],
    }
}

fn value(n: i64) -> Vec<Vec<u8>> {
    vec![int64::pack(n)]
}

#[test]
fn transfer_converges_with_live_writes() {
    let space = kv_space();
    let region = RegionId::new(space.id, 0, 0, 0);

    // B starts outside the cluster; A owns the region alone.
    let config = whole_subspace_config(space.clone(), &[&[A]]);
    let mut cluster = Cluster::new(config, &[A, B]);

    for i in 0..50i64 {
        let key = format!("key{i:03}");
        let resp = cluster.put(&space, key.as_bytes(), value(i));
        assert_eq!(resp.status, Status::Success);
    }

    // The coordinator appends B to the chain and orders the handoff.
    let mut next = cluster.config.clone();
    next.version += 1;
    next.entities
        .insert(tessera_core::EntityId::new(region, 1), B);
    next.transfers.push(TransferSpec {
        id: XFER,
        region,
        from: A,
        to: B,
    });
    cluster.reconfigure(next);

    // Writes keep flowing while the snapshot streams across: updates to
    // transferred keys and brand-new keys alike.
    for i in 0..20i64 {
        let key = format!("key{i:03}");
        let resp = cluster.put(&space, key.as_bytes(), value(1000 + i));
        assert_eq!(resp.status, Status::Success);
    }

    for i in 50..60i64 {
        let key = format!("key{i:03}");
        let resp = cluster.put(&space, key.as_bytes(), value(i));
        assert_eq!(resp.status, Status::Success);
    }

    for _ in 0..100 {
        cluster.settle();

        if cluster.node(B).transfer_complete(XFER) {
            break;
        }
    }

    assert!(
        cluster.node(B).transfer_complete(XFER),
        "transfer did not converge"
    );
    assert!(!cluster.node(B).transfer_failed(XFER));

    // Zero versions lost, none duplicated: B's region is byte-for-byte
    // what A holds.
    let mut ours = cluster.node(A).store().scan_objects(&region).unwrap();
    let mut theirs = cluster.node(B).store().scan_objects(&region).unwrap();
    ours.sort_by(|a, b| a.key.cmp(&b.key));
    theirs.sort_by(|a, b| a.key.cmp(&b.key));

    assert_eq!(ours.len(), 60);
    assert_eq!(ours, theirs);
}

#[test]
fn quiet_transfer_goes_live_after_the_stream_drains() {
    let space = kv_space();
    let region = RegionId::new(space.id, 0, 0, 0);

    let config = whole_subspace_config(space.clone(), &[&[A]]);
    let mut cluster = Cluster::new(config, &[A, B]);

    for i in 0..10i64 {
        let key = format!("key{i:03}");
        cluster.put(&space, key.as_bytes(), value(i));
    }

    cluster.order_transfer(XFER, region, A, B);

    for _ in 0..100 {
        cluster.settle();

        if cluster.node(B).transfer_complete(XFER) {
            break;
        }
    }

    assert!(cluster.node(B).transfer_complete(XFER));

    let theirs = cluster.node(B).store().scan_objects(&region).unwrap();
    assert_eq!(theirs.len(), 10);
}

#[test]
fn a_dropped_transfer_order_tears_the_state_down() {
    let space = kv_space();
    let region = RegionId::new(space.id, 0, 0, 0);

    let config = whole_subspace_config(space.clone(), &[&[A]]);
    let mut cluster = Cluster::new(config, &[A, B]);

    let mut with_xfer = cluster.config.clone();
    with_xfer.version += 1;
    with_xfer.transfers.push(TransferSpec {
        id: XFER,
        region,
        from: A,
        to: B,
    });
    cluster.reconfigure(with_xfer);

    let mut without = cluster.config.clone();
    without.version += 1;
    without.transfers.clear();
    cluster.reconfigure(without);

    assert!(!cluster.node(B).transfer_complete(XFER));
    assert!(!cluster.node(B).transfer_failed(XFER));
}
