//! The contract between the replication layer and the on-disk store.
//!
//! The store keeps exactly one version per object plus forward index
//! entries for the searchable attributes of the hosting subspace. Writes
//! are atomic: the object record, its version bump, and the index delta
//! land in a single batch or not at all.

use thiserror::Error;

use crate::{AttrNum, RegionId, Space, Version};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bad encoding: {0}")]
    BadEncoding(String),

    #[error("region {0} not hosted")]
    MissingRegion(RegionId),

    #[error("storage error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn internal<T>(value: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        StoreError::Internal(value.into())
    }
}

/// One record as seen by a region snapshot or an object scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: Vec<u8>,
    pub version: Version,
    /// `None` marks a deletion when replaying a snapshot stream.
    pub value: Option<Vec<Vec<u8>>>,
}

/// Inclusive bounds over the order-preserving image of one attribute.
#[derive(Debug, Clone, Default)]
pub struct IndexRange {
    pub lower: Option<Vec<u8>>,
    pub upper: Option<Vec<u8>>,
}

pub trait DataStore: Clone + Send + Sync + 'static {
    type Snapshot: Iterator<Item = ObjectEntry> + Send;

    fn get(
        &self,
        region: &RegionId,
        key: &[u8],
    ) -> Result<Option<(Vec<Vec<u8>>, Version)>, StoreError>;

    /// Write one object version together with its index delta.
    fn put(
        &self,
        region: &RegionId,
        space: &Space,
        key: &[u8],
        value: &[Vec<u8>],
        version: Version,
    ) -> Result<(), StoreError>;

    /// Remove the object and its index entries.
    fn del(&self, region: &RegionId, space: &Space, key: &[u8]) -> Result<(), StoreError>;

    /// Point-in-time view of a region's objects, for transfers.
    fn snapshot(&self, region: &RegionId) -> Result<Self::Snapshot, StoreError>;

    /// All objects currently in a region, for search fallback scans.
    fn scan_objects(&self, region: &RegionId) -> Result<Vec<ObjectEntry>, StoreError>;

    /// Record keys whose indexed attribute value falls within `range`,
    /// in ascending value order.
    fn scan_index(
        &self,
        region: &RegionId,
        space: &Space,
        attr: AttrNum,
        range: &IndexRange,
    ) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Remember that the point leader of `leader` acked client sequence
    /// `seq` while we hosted `region`; survives restarts so replayed
    /// client operations can be dropped.
    fn mark_acked(
        &self,
        region: &RegionId,
        leader: &RegionId,
        seq: u64,
    ) -> Result<(), StoreError>;

    fn is_acked(&self, region: &RegionId, leader: &RegionId, seq: u64) -> Result<bool, StoreError>;
}
