//! End-to-end chain replication scenarios over a two-node cluster with
//! two subspaces: writes ring through every entity before the point
//! leader answers the client.

use tessera_core::wire::Status;
use tessera_core::{
    Attribute, AttributeCheck, DataStore, DataType, EntityId, InstanceId, Predicate, RegionId,
    Space, SpaceId, Subspace,
};
use tessera_daemon::{AttrFuncall, ChainMessage, Message};
use tessera_testing::{users_space, whole_subspace_config, Cluster};
use tessera_types::{int64, FuncName, Funcall};

const A: InstanceId = InstanceId(1);
const B: InstanceId = InstanceId(2);

fn two_node_cluster() -> (Cluster, Space) {
    let space = users_space(SpaceId(1));
    let config = whole_subspace_config(space.clone(), &[&[A, B], &[B, A]]);
    (Cluster::new(config, &[A, B]), space)
}

fn age_add(n: i64) -> AttrFuncall {
    AttrFuncall {
        attr: 2,
        func: Funcall::unary(FuncName::NumAdd, DataType::Int64, int64::pack(n)),
    }
}

#[test]
fn put_then_get() {
    let (cluster, space) = two_node_cluster();

    let value = vec![b"Alice".to_vec(), int64::pack(30)];
    let resp = cluster.put(&space, b"alice", value.clone());
    assert_eq!(resp.status, Status::Success);

    let got = cluster.get(&space, b"alice");
    assert_eq!(got.status, Status::Success);

    let (read, version) = got.value.unwrap();
    assert_eq!(read, value);
    assert_eq!(version, 1);

    // Every chain participant committed the same version, in both
    // subspaces.
    let leader = cluster.point_leader(&space, b"alice");
    let value_region = RegionId::new(space.id, 1, 0, 0);

    for node in [A, B] {
        let store = cluster.node(node).store();
        let (_, v0) = store.get(&leader.region, b"alice").unwrap().unwrap();
        assert_eq!(v0, 1);
        let (_, v1) = store.get(&value_region, b"alice").unwrap().unwrap();
        assert_eq!(v1, 1);
    }
}

#[test]
fn get_of_a_missing_key_is_notfound() {
    let (cluster, space) = two_node_cluster();
    let got = cluster.get(&space, b"nobody");
    assert_eq!(got.status, Status::NotFound);
}

#[test]
fn del_of_a_missing_key_terminates_with_notfound() {
    let (cluster, space) = two_node_cluster();
    let resp = cluster.del(&space, b"ghost");
    assert_eq!(resp.status, Status::NotFound);
}

#[test]
fn put_with_wrong_arity_is_rejected_before_any_state_change() {
    let (cluster, space) = two_node_cluster();

    let resp = cluster.put(&space, b"alice", vec![b"Alice".to_vec()]);
    assert_eq!(resp.status, Status::WrongArity);

    let got = cluster.get(&space, b"alice");
    assert_eq!(got.status, Status::NotFound);
}

#[test]
fn delete_removes_the_record_everywhere() {
    let (cluster, space) = two_node_cluster();

    cluster.put(&space, b"bob", vec![b"Bob".to_vec(), int64::pack(9)]);
    let resp = cluster.del(&space, b"bob");
    assert_eq!(resp.status, Status::Success);

    assert_eq!(cluster.get(&space, b"bob").status, Status::NotFound);

    let value_region = RegionId::new(space.id, 1, 0, 0);
    for node in [A, B] {
        let store = cluster.node(node).store();
        assert!(store.get(&value_region, b"bob").unwrap().is_none());
    }
}

#[test]
fn atomic_increments_race_to_a_serial_history() {
    let (cluster, space) = two_node_cluster();

    cluster.put(&space, b"views", vec![b"Views".to_vec(), int64::pack(100)]);

    let batches = (0..8).map(|_| vec![age_add(1)]).collect();
    let nonces = cluster.concurrent_atomics(&space, b"views", batches);

    for nonce in nonces {
        let resp = cluster.link.take_response(nonce).expect("atomic terminated");
        assert_eq!(resp.status, Status::Success);
    }

    let got = cluster.get(&space, b"views");
    let (value, version) = got.value.unwrap();
    assert_eq!(int64::unpack(&value[1]), 108);

    // Versions 2..=9, strictly monotonic, no gaps: the last one is 9
    // and every replica agrees.
    assert_eq!(version, 9);

    let leader = cluster.point_leader(&space, b"views");
    for node in [A, B] {
        let (_, v) = cluster
            .node(node)
            .store()
            .get(&leader.region, b"views")
            .unwrap()
            .unwrap();
        assert_eq!(v, 9);
    }
}

#[test]
fn atomic_overflow_fails_the_whole_mutation() {
    let (cluster, space) = two_node_cluster();

    cluster.put(&space, b"max", vec![b"Max".to_vec(), int64::pack(i64::MAX)]);

    let resp = cluster.atomic(&space, b"max", vec![age_add(1)]);
    assert_eq!(resp.status, Status::Overflow);

    let got = cluster.get(&space, b"max");
    assert_eq!(int64::unpack(&got.value.unwrap().0[1]), i64::MAX);
}

#[test]
fn atomic_on_a_missing_key_is_notfound() {
    let (cluster, space) = two_node_cluster();
    let resp = cluster.atomic(&space, b"none", vec![age_add(1)]);
    assert_eq!(resp.status, Status::NotFound);
}

#[test]
fn conditional_put_compares_and_swaps_once() {
    let (cluster, space) = two_node_cluster();

    cluster.put(&space, b"k1", vec![b"Bob".to_vec(), int64::pack(5)]);

    let check = AttributeCheck::new(1, Predicate::Equals, DataType::String, b"Bob".to_vec());
    let resp = cluster.cond_put(
        &space,
        b"k1",
        vec![check.clone()],
        vec![b"Bobby".to_vec(), int64::pack(5)],
    );
    assert_eq!(resp.status, Status::Success);

    let resp = cluster.cond_put(
        &space,
        b"k1",
        vec![check],
        vec![b"Robert".to_vec(), int64::pack(5)],
    );
    assert_eq!(resp.status, Status::CmpFail);

    let got = cluster.get(&space, b"k1");
    assert_eq!(got.value.unwrap().0[0], b"Bobby");
}

#[test]
fn put_after_delete_starts_a_fresh_history() {
    let (cluster, space) = two_node_cluster();

    cluster.put(&space, b"kv", vec![b"One".to_vec(), int64::pack(1)]);
    cluster.del(&space, b"kv");
    let resp = cluster.put(&space, b"kv", vec![b"Two".to_vec(), int64::pack(2)]);
    assert_eq!(resp.status, Status::Success);

    // The delete drained the key's window and removed it from disk, so
    // the new write is fresh and versions restart.
    let got = cluster.get(&space, b"kv");
    let (value, version) = got.value.unwrap();
    assert_eq!(value[0], b"Two");
    assert_eq!(version, 1);
}

#[test]
fn updates_move_the_record_between_value_regions() {
    // Split subspace 1 so that changing the value can hop regions and
    // exercise the cross-boundary handoff.
    let space = users_space(SpaceId(1));
    let mut config = whole_subspace_config(space.clone(), &[&[A, B], &[B, A]]);
    tessera_testing::split_subspace(&mut config, space.id, 1, &[A], &[B]);
    let cluster = Cluster::new(config, &[A, B]);

    cluster.put(&space, b"mv", vec![b"First".to_vec(), int64::pack(1)]);

    // Rewrite the value a few times; at least one rewrite crosses the
    // half-point split with overwhelming probability.
    for i in 2..10i64 {
        let name = format!("Name{i}");
        let resp = cluster.put(&space, b"mv", vec![name.into_bytes(), int64::pack(i)]);
        assert_eq!(resp.status, Status::Success);
    }

    let got = cluster.get(&space, b"mv");
    let (value, version) = got.value.unwrap();
    assert_eq!(int64::unpack(&value[1]), 9);
    assert_eq!(version, 9);

    // Exactly one value region holds the record now.
    let low = RegionId::new(space.id, 1, 1, 0);
    let high = RegionId::new(space.id, 1, 1, 0x8000_0000_0000_0000);
    let in_low = cluster.node(A).store().get(&low, b"mv").unwrap().is_some();
    let in_high = cluster.node(B).store().get(&high, b"mv").unwrap().is_some();
    assert!(in_low ^ in_high, "record must live in exactly one region");
}

#[test]
fn chain_handlers_are_idempotent() {
    // Degenerate one-node ring: the single entity is head, tail, and
    // point leader at once, so a chain message can be injected directly.
    let space = Space {
        id: SpaceId(3),
        name: "kv".into(),
        attrs: vec![
            Attribute::new("k", DataType::String),
            Attribute::new("v", DataType::String),
        ],
        subspaces: vec![Subspace::new(vec![0])],
        doc_indexes: vec![],
    };
    let config = whole_subspace_config(space.clone(), &[&[A]]);
    let cluster = Cluster::new(config, &[A]);

    let region = RegionId::new(space.id, 0, 0, 0);
    let entity = EntityId::new(region, 0);

    let put = Message::Chain(ChainMessage::Put {
        version: 1,
        fresh: true,
        key: b"dup".to_vec(),
        value: vec![b"payload".to_vec()],
    });

    cluster.node(A).deliver(entity, entity, put.clone());
    cluster.settle();
    cluster.node(A).deliver(entity, entity, put);
    cluster.settle();

    let (value, version) = cluster
        .node(A)
        .store()
        .get(&region, b"dup")
        .unwrap()
        .unwrap();
    assert_eq!(version, 1);
    assert_eq!(value[0], b"payload");
}
