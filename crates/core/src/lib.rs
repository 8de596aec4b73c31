//! Traits and machinery that are common to all tessera crates.
//!
//! Glossary:
//!  - `space`: a named schema, one key attribute plus N typed attributes.
//!  - `subspace`: a partitioning of a space by a subset of its attributes.
//!  - `region`: a prefix-masked tile of a subspace, owned by a chain of
//!    replicas.
//!  - `entity`: a (region, position) pair identifying one replica in a
//!    region's chain.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

pub mod config;
pub mod hyperspace;
pub mod ordered;
pub mod schema;
pub mod store;
pub mod wire;

pub use config::*;
pub use schema::*;
pub use store::*;

/// Monotonically increasing per-key revision number.
pub type Version = u64;

/// The position of an attribute within a space (0 is the key).
pub type AttrNum = u16;

/// Client-chosen request identifier, unique per client connection.
pub type Nonce = u64;

/// Sequence number of an entry within a region transfer.
pub type XferSeq = u64;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SpaceId(pub u32);

impl SpaceId {
    /// Sentinel space used by client-side entities.
    pub const CLIENT: SpaceId = SpaceId(u32::MAX);
}

impl Display for SpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct InstanceId(pub u64);

impl Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "i{}", self.0)
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TransferId(pub u16);

impl Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// A prefix-masked tile of one subspace.
///
/// A point `p` belongs to the region iff
/// `p & prefixmask(prefix) == mask`. A region computed from a concrete
/// value carries `prefix = 64` and `mask = point`; configured regions
/// carry shorter prefixes.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RegionId {
    pub space: SpaceId,
    pub subspace: u16,
    pub prefix: u8,
    pub mask: u64,
}

impl RegionId {
    pub fn new(space: SpaceId, subspace: u16, prefix: u8, mask: u64) -> Self {
        Self {
            space,
            subspace,
            prefix,
            mask,
        }
    }

    /// Region for a concrete 64-bit point.
    pub fn point(space: SpaceId, subspace: u16, point: u64) -> Self {
        Self::new(space, subspace, 64, point)
    }

    pub fn contains(&self, point: u64) -> bool {
        point & hyperspace::prefixmask(self.prefix) == self.mask
    }

    /// Whether two regions of the same subspace share any point.
    pub fn overlaps(&self, other: &RegionId) -> bool {
        if self.space != other.space || self.subspace != other.subspace {
            return false;
        }

        let narrow = self.prefix.min(other.prefix);
        let mask = hyperspace::prefixmask(narrow);
        self.mask & mask == other.mask & mask
    }

    /// Stable byte rendering, used for lock striping and log output.
    pub fn to_bytes(&self) -> [u8; 15] {
        let mut out = [0u8; 15];
        out[..4].copy_from_slice(&self.space.0.to_be_bytes());
        out[4..6].copy_from_slice(&self.subspace.to_be_bytes());
        out[6] = self.prefix;
        out[7..].copy_from_slice(&self.mask.to_be_bytes());
        out
    }
}

impl Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}:{:016x}",
            self.space, self.subspace, self.prefix, self.mask
        )
    }
}

/// One replica in a region's chain. Position 0 receives client writes and
/// is the point leader when the region lives in subspace 0.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct EntityId {
    pub region: RegionId,
    pub number: u8,
}

impl EntityId {
    pub fn new(region: RegionId, number: u8) -> Self {
        Self { region, number }
    }

    /// Client-side entities are tagged with the sentinel space; the mask
    /// carries the connection identity.
    pub fn client(token: u64) -> Self {
        Self {
            region: RegionId::new(SpaceId::CLIENT, 0, 0, token),
            number: 0,
        }
    }

    pub fn is_client(&self) -> bool {
        self.region.space == SpaceId::CLIENT
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.region, self.number)
    }
}

/// Attribute type tag. The registry in `tessera-types` attaches behavior
/// to each tag; this enum is plain data so that schemas and configs can
/// be carried anywhere.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Int64,
    Float,
    Document,
    Timestamp(TimeUnit),
    MacaroonSecret,
    List(Primitive),
    Set(Primitive),
    Map(Primitive, Primitive),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

/// The types that may appear inside lists, sets, and maps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    String,
    Int64,
    Float,
}

impl From<Primitive> for DataType {
    fn from(value: Primitive) -> Self {
        match value {
            Primitive::String => DataType::String,
            Primitive::Int64 => DataType::Int64,
            Primitive::Float => DataType::Float,
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::String => write!(f, "string"),
            DataType::Int64 => write!(f, "int64"),
            DataType::Float => write!(f, "float"),
            DataType::Document => write!(f, "document"),
            DataType::Timestamp(unit) => write!(f, "timestamp({unit:?})"),
            DataType::MacaroonSecret => write!(f, "macaroon_secret"),
            DataType::List(e) => write!(f, "list({e:?})"),
            DataType::Set(e) => write!(f, "set({e:?})"),
            DataType::Map(k, v) => write!(f, "map({k:?},{v:?})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown space {0}")]
    UnknownSpace(SpaceId),

    #[error("space {0} has no subspace {1}")]
    UnknownSubspace(SpaceId, u16),

    #[error("no region of {0}/{1} covers point {2:016x}")]
    UncoveredPoint(SpaceId, u16, u64),

    #[error("internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Storage knobs for a daemon process.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StorageConfig {
    /// Directory where to find storage. If undefined, ephemeral storage
    /// will be used.
    pub path: Option<std::path::PathBuf>,

    /// Size (in Mb) of memory allocated for block caching
    pub cache: Option<usize>,

    /// Number of stripes in the keyholder lock table
    pub lock_stripes: Option<usize>,

    /// Milliseconds between retransmission sweeps
    pub retransmit_interval: Option<u64>,
}

impl StorageConfig {
    pub fn is_ephemeral(&self) -> bool {
        self.path.is_none()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: Some(std::path::PathBuf::from("data")),
            cache: None,
            lock_stripes: None,
            retransmit_interval: None,
        }
    }
}
