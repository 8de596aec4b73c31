//! The cluster view consumed from the coordinator.
//!
//! A configuration is installed atomically: the daemon swaps the whole
//! structure, never patches it in place. Queries here answer the routing
//! questions the replication layer asks: which entities form a region's
//! chain, which instance hosts an entity, and which configured region
//! covers a computed point.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, EntityId, InstanceId, RegionId, Space, SpaceId, TransferId};

/// A pending region handoff ordered by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSpec {
    pub id: TransferId,
    pub region: RegionId,
    pub from: InstanceId,
    pub to: InstanceId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub version: u64,
    #[serde(with = "pairs")]
    pub spaces: BTreeMap<SpaceId, Space>,
    #[serde(with = "pairs")]
    pub entities: BTreeMap<EntityId, InstanceId>,
    pub transfers: Vec<TransferSpec>,
}

/// Maps with non-string keys travel as sequences of pairs so the
/// configuration stays readable in any serde format.
mod pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let entries = Vec::<(K, V)>::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

impl ClusterConfig {
    pub fn space(&self, id: SpaceId) -> Result<&Space, ConfigError> {
        self.spaces.get(&id).ok_or(ConfigError::UnknownSpace(id))
    }

    /// Number of attributes (key included) in a space.
    pub fn dimensionality(&self, id: SpaceId) -> Result<usize, ConfigError> {
        Ok(self.space(id)?.dimensionality())
    }

    /// Number of subspaces a space is partitioned into.
    pub fn subspaces(&self, id: SpaceId) -> Result<u16, ConfigError> {
        Ok(self.space(id)?.subspaces.len() as u16)
    }

    pub fn dimensions(&self, id: SpaceId, subspace: u16) -> Result<Vec<bool>, ConfigError> {
        self.space(id)?
            .dimensions(subspace)
            .ok_or(ConfigError::UnknownSubspace(id, subspace))
    }

    pub fn instance_of(&self, entity: &EntityId) -> Option<InstanceId> {
        self.entities.get(entity).copied()
    }

    /// The configured region of `space/subspace` that covers `point`.
    pub fn locate(&self, space: SpaceId, subspace: u16, point: u64) -> Option<RegionId> {
        self.entities
            .keys()
            .map(|e| e.region)
            .find(|r| r.space == space && r.subspace == subspace && r.contains(point))
    }

    /// Resolve a possibly point-valued region (prefix 64) onto the
    /// configured region that covers it.
    pub fn resolve(&self, region: &RegionId) -> Option<RegionId> {
        if self
            .entities
            .keys()
            .any(|e| e.region == *region)
        {
            return Some(*region);
        }

        self.locate(region.space, region.subspace, region.mask)
    }

    /// The entities of a region's chain, ordered by position.
    pub fn chain_of(&self, region: &RegionId) -> Vec<EntityId> {
        let Some(region) = self.resolve(region) else {
            return Vec::new();
        };

        self.entities
            .keys()
            .filter(|e| e.region == region)
            .copied()
            .collect()
    }

    pub fn head_of(&self, region: &RegionId) -> Option<EntityId> {
        self.chain_of(region).first().copied()
    }

    pub fn tail_of(&self, region: &RegionId) -> Option<EntityId> {
        self.chain_of(region).last().copied()
    }

    /// The entity at a given chain position, if any.
    pub fn entity_at(&self, region: &RegionId, number: u8) -> Option<EntityId> {
        let region = self.resolve(region)?;
        let candidate = EntityId::new(region, number);
        self.entities.contains_key(&candidate).then_some(candidate)
    }

    /// The entity of `region` hosted by `us`, if any.
    pub fn our_entity(&self, region: &RegionId, us: InstanceId) -> Option<EntityId> {
        let region = self.resolve(region)?;

        self.entities
            .iter()
            .find(|(e, i)| e.region == region && **i == us)
            .map(|(e, _)| *e)
    }

    /// All regions with at least one entity hosted by `us`.
    pub fn regions_on(&self, us: InstanceId) -> Vec<RegionId> {
        let mut out: Vec<RegionId> = self
            .entities
            .iter()
            .filter(|(_, i)| **i == us)
            .map(|(e, _)| e.region)
            .collect();
        out.dedup();
        out
    }

    pub fn transfers_to(&self, us: InstanceId) -> Vec<&TransferSpec> {
        self.transfers.iter().filter(|t| t.to == us).collect()
    }

    pub fn transfers_from(&self, us: InstanceId) -> Vec<&TransferSpec> {
        self.transfers.iter().filter(|t| t.from == us).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attribute, DataType, Subspace};

    fn config() -> ClusterConfig {
        let space = Space {
            id: SpaceId(1),
            name: "kv".into(),
            attrs: vec![
                Attribute::new("k", DataType::String),
                Attribute::new("v", DataType::String),
            ],
            subspaces: vec![Subspace::new(vec![0]), Subspace::new(vec![1])],
            doc_indexes: vec![],
        };

        let low = RegionId::new(SpaceId(1), 0, 1, 0);
        let high = RegionId::new(SpaceId(1), 0, 1, 0x8000_0000_0000_0000);

        let mut entities = BTreeMap::new();
        entities.insert(EntityId::new(low, 0), InstanceId(1));
        entities.insert(EntityId::new(low, 1), InstanceId(2));
        entities.insert(EntityId::new(high, 0), InstanceId(2));

        ClusterConfig {
            version: 3,
            spaces: [(SpaceId(1), space)].into(),
            entities,
            transfers: vec![],
        }
    }

    #[test]
    fn locate_picks_the_covering_region() {
        let cfg = config();
        let low = cfg.locate(SpaceId(1), 0, 0x1234).unwrap();
        assert_eq!(low.mask, 0);
        let high = cfg.locate(SpaceId(1), 0, 0xf000_0000_0000_0000).unwrap();
        assert_eq!(high.mask, 0x8000_0000_0000_0000);
    }

    #[test]
    fn chain_queries_follow_entity_order() {
        let cfg = config();
        let low = RegionId::new(SpaceId(1), 0, 1, 0);
        let chain = cfg.chain_of(&low);
        assert_eq!(chain.len(), 2);
        assert_eq!(cfg.head_of(&low).unwrap().number, 0);
        assert_eq!(cfg.tail_of(&low).unwrap().number, 1);
    }

    #[test]
    fn resolve_maps_points_onto_configured_regions() {
        let cfg = config();
        let point = RegionId::point(SpaceId(1), 0, 0x9999_0000_0000_0000);
        let resolved = cfg.resolve(&point).unwrap();
        assert_eq!(resolved.prefix, 1);
        assert_eq!(resolved.mask, 0x8000_0000_0000_0000);
    }

    #[test]
    fn our_entity_finds_the_hosted_position() {
        let cfg = config();
        let low = RegionId::new(SpaceId(1), 0, 1, 0);
        assert_eq!(cfg.our_entity(&low, InstanceId(2)).unwrap().number, 1);
        assert!(cfg.our_entity(&low, InstanceId(9)).is_none());
    }
}
