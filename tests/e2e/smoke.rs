//! Smoke test over the public surface: a two-node cluster takes writes,
//! serves reads, and survives a configuration reinstall.

use tessera_core::wire::Status;
use tessera_core::{InstanceId, SpaceId};
use tessera_testing::{users_space, whole_subspace_config, Cluster};
use tessera_types::int64;

const A: InstanceId = InstanceId(1);
const B: InstanceId = InstanceId(2);

#[test]
fn write_read_cycle() {
    let space = users_space(SpaceId(1));
    let config = whole_subspace_config(space.clone(), &[&[A, B], &[B, A]]);
    let cluster = Cluster::new(config, &[A, B]);

    let resp = cluster.put(&space, b"smoke", vec![b"Smoke".to_vec(), int64::pack(1)]);
    assert_eq!(resp.status, Status::Success);

    let got = cluster.get(&space, b"smoke");
    assert_eq!(got.status, Status::Success);
    assert_eq!(got.value.unwrap().1, 1);
}

#[test]
fn reinstalling_the_same_view_changes_nothing() {
    let space = users_space(SpaceId(1));
    let config = whole_subspace_config(space.clone(), &[&[A, B], &[B, A]]);
    let mut cluster = Cluster::new(config.clone(), &[A, B]);

    cluster.put(&space, b"stay", vec![b"Stay".to_vec(), int64::pack(7)]);

    let mut next = config;
    next.version += 1;
    cluster.reconfigure(next);

    let got = cluster.get(&space, b"stay");
    assert_eq!(got.status, Status::Success);
    assert_eq!(int64::unpack(&got.value.unwrap().0[1]), 7);
}
