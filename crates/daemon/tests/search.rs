//! Index-backed range scans over a populated space.

use tessera_core::wire::Status;
use tessera_core::{AttributeCheck, DataType, InstanceId, Predicate, SpaceId};
use tessera_testing::{users_space, whole_subspace_config, Cluster};
use tessera_types::int64;

const A: InstanceId = InstanceId(1);

#[test]
fn range_scan_returns_the_window_in_order() {
    let space = users_space(SpaceId(1));
    let config = whole_subspace_config(space.clone(), &[&[A], &[A]]);
    let cluster = Cluster::new(config, &[A]);

    for i in 0..1000i64 {
        let age = i - 500;
        let key = format!("user{i:04}");
        let name = format!("User {i}");
        let resp = cluster.put(
            &space,
            key.as_bytes(),
            vec![name.into_bytes(), int64::pack(age)],
        );
        assert_eq!(resp.status, Status::Success);
    }

    let checks = vec![
        AttributeCheck::new(2, Predicate::GreaterEqual, DataType::Int64, int64::pack(-10)),
        AttributeCheck::new(2, Predicate::LessEqual, DataType::Int64, int64::pack(10)),
    ];

    let results = cluster
        .node(A)
        .search(space.id, &checks, Some((2, false)))
        .unwrap();

    assert_eq!(results.len(), 21);

    let ages: Vec<i64> = results.iter().map(|r| int64::unpack(&r.value[1])).collect();
    let expected: Vec<i64> = (-10..=10).collect();
    assert_eq!(ages, expected);
}

#[test]
fn maximize_reverses_the_order() {
    let space = users_space(SpaceId(1));
    let config = whole_subspace_config(space.clone(), &[&[A], &[A]]);
    let cluster = Cluster::new(config, &[A]);

    for i in 0..20i64 {
        let key = format!("u{i}");
        cluster.put(
            &space,
            key.as_bytes(),
            vec![b"N".to_vec(), int64::pack(i)],
        );
    }

    let checks = vec![AttributeCheck::new(
        2,
        Predicate::GreaterEqual,
        DataType::Int64,
        int64::pack(15),
    )];

    let results = cluster
        .node(A)
        .search(space.id, &checks, Some((2, true)))
        .unwrap();

    let ages: Vec<i64> = results.iter().map(|r| int64::unpack(&r.value[1])).collect();
    assert_eq!(ages, vec![19, 18, 17, 16, 15]);
}

#[test]
fn unindexed_predicates_fall_back_to_object_scans() {
    let space = users_space(SpaceId(1));
    let config = whole_subspace_config(space.clone(), &[&[A], &[A]]);
    let cluster = Cluster::new(config, &[A]);

    cluster.put(&space, b"alice", vec![b"Alice".to_vec(), int64::pack(30)]);
    cluster.put(&space, b"bob", vec![b"Bob".to_vec(), int64::pack(20)]);
    cluster.put(&space, b"alfred", vec![b"Alfred".to_vec(), int64::pack(50)]);

    let checks = vec![AttributeCheck::new(
        1,
        Predicate::Regex,
        DataType::String,
        b"^Al".to_vec(),
    )];

    let mut results = cluster.node(A).search(space.id, &checks, None).unwrap();
    results.sort_by(|a, b| a.key.cmp(&b.key));

    let keys: Vec<&[u8]> = results.iter().map(|r| r.key.as_slice()).collect();
    assert_eq!(keys, vec![&b"alfred"[..], &b"alice"[..]]);
}

#[test]
fn search_on_an_unknown_space_fails() {
    let space = users_space(SpaceId(1));
    let config = whole_subspace_config(space.clone(), &[&[A], &[A]]);
    let cluster = Cluster::new(config, &[A]);

    let err = cluster.node(A).search(SpaceId(99), &[], None);
    assert!(err.is_err());
}
