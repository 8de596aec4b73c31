//! Mapping records onto hyperspace points.
//!
//! The bit-level interlacing lives in `tessera_core::hyperspace`; this
//! module supplies the per-attribute hashes that feed it.

use tessera_core::hyperspace::replication_point;
use tessera_core::{RegionId, Space};

use crate::TypeInfo;

/// Hash the key and every value attribute of a record. Attributes whose
/// type is not hashable contribute zero; schemas are expected to keep
/// them out of subspaces.
pub fn point_hashes(space: &Space, key: &[u8], value: &[Vec<u8>]) -> (u64, Vec<u64>) {
    let key_hash = TypeInfo::of(space.key_type()).hash(key).unwrap_or(0);

    let value_hashes = space
        .attrs
        .iter()
        .skip(1)
        .zip(value.iter())
        .map(|(attr, bytes)| TypeInfo::of(attr.datatype).hash(bytes).unwrap_or(0))
        .collect();

    (key_hash, value_hashes)
}

/// The point a record occupies in one subspace of its space.
pub fn point_of(space: &Space, subspace: u16, key: &[u8], value: &[Vec<u8>]) -> Option<u64> {
    let dims = space.dimensions(subspace)?;
    let (key_hash, value_hashes) = point_hashes(space, key, value);
    Some(replication_point(key_hash, &value_hashes, &dims))
}

/// The point-valued region a record occupies in one subspace.
pub fn region_of(space: &Space, subspace: u16, key: &[u8], value: &[Vec<u8>]) -> Option<RegionId> {
    let point = point_of(space, subspace, key, value)?;
    Some(RegionId::point(space.id, subspace, point))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{Attribute, DataType, SpaceId, Subspace};

    use crate::int64;

    fn users() -> Space {
        Space {
            id: SpaceId(3),
            name: "users".into(),
            attrs: vec![
                Attribute::new("username", DataType::String),
                Attribute::new("name", DataType::String),
                Attribute::new("age", DataType::Int64),
            ],
            subspaces: vec![Subspace::new(vec![0]), Subspace::new(vec![1, 2])],
            doc_indexes: vec![],
        }
    }

    #[test]
    fn subspace_zero_hashes_the_key_alone() {
        let space = users();
        let value = vec![b"Alice".to_vec(), int64::pack(30)];
        let point = point_of(&space, 0, b"alice", &value).unwrap();

        let (key_hash, _) = point_hashes(&space, b"alice", &value);
        assert_eq!(point, key_hash);
    }

    #[test]
    fn value_changes_move_the_point_in_value_subspaces() {
        let space = users();
        let v1 = vec![b"Alice".to_vec(), int64::pack(30)];
        let v2 = vec![b"Alice".to_vec(), int64::pack(31)];

        assert_eq!(
            point_of(&space, 0, b"alice", &v1),
            point_of(&space, 0, b"alice", &v2)
        );
        assert_ne!(
            point_of(&space, 1, b"alice", &v1),
            point_of(&space, 1, b"alice", &v2)
        );
    }

    #[test]
    fn region_of_carries_a_full_prefix() {
        let space = users();
        let value = vec![b"Bob".to_vec(), int64::pack(5)];
        let region = region_of(&space, 1, b"bob", &value).unwrap();
        assert_eq!(region.prefix, 64);
        assert!(region.contains(region.mask));
    }
}
