use std::path::PathBuf;

use miette::{Context, IntoDiagnostic, Result};

use tessera_core::{
    Attribute, ClusterConfig, DataType, EntityId, InstanceId, RegionId, Space, SpaceId, Subspace,
};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Directory to write the starter files into
    #[clap(long, default_value = ".")]
    pub dir: PathBuf,
}

const SAMPLE_TOML: &str = r#"cluster = "cluster.json"

[node]
instance = 1

[storage]
path = "data"

[logging]
max_level = "info"
"#;

/// A single-node view of one key/value space, enough to take writes
/// immediately.
fn sample_cluster() -> ClusterConfig {
    let space = Space {
        id: SpaceId(1),
        name: "kv".into(),
        attrs: vec![
            Attribute::new("key", DataType::String),
            Attribute::new("value", DataType::String),
        ],
        subspaces: vec![Subspace::new(vec![0]), Subspace::new(vec![1])],
        doc_indexes: vec![],
    };

    let mut config = ClusterConfig {
        version: 1,
        ..Default::default()
    };
    config.spaces.insert(space.id, space);

    for subspace in 0..2u16 {
        let region = RegionId::new(SpaceId(1), subspace, 0, 0);
        config.entities.insert(EntityId::new(region, 0), InstanceId(1));
    }

    config
}

pub fn run(args: &Args) -> Result<()> {
    std::fs::create_dir_all(&args.dir)
        .into_diagnostic()
        .context("creating target directory")?;

    let toml_path = args.dir.join("tessera.toml");
    std::fs::write(&toml_path, SAMPLE_TOML)
        .into_diagnostic()
        .context("writing tessera.toml")?;

    let cluster_path = args.dir.join("cluster.json");
    let cluster = serde_json::to_vec_pretty(&sample_cluster()).into_diagnostic()?;
    std::fs::write(&cluster_path, cluster)
        .into_diagnostic()
        .context("writing cluster.json")?;

    println!("wrote {} and {}", toml_path.display(), cluster_path.display());
    Ok(())
}
