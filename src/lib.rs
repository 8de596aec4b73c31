//! Process-level glue for the tessera daemon: configuration loading and
//! the single-node loopback link.
//!
//! The heavy lifting lives in the workspace crates; this facade wires a
//! store, a replication manager, and a link together for the binary.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use tessera_core::StorageConfig;

pub mod loopback;

pub use loopback::LoopbackLink;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This process's identity in the coordinator's entity map.
    pub instance: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { instance: 1 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Maximum level, one of error/warn/info/debug/trace.
    pub max_level: Option<String>,

    /// Include the storage layer's targets in the filter.
    #[serde(default)]
    pub include_store: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the coordinator-produced cluster view (json).
    pub cluster: PathBuf,
}

impl Config {
    /// Layer the config file under `TESSERA_*` environment overrides.
    pub fn load(path: &std::path::Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("TESSERA").separator("__"))
            .build()?
            .try_deserialize()
    }
}
