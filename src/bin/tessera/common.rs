use tracing::Level;
use tracing_subscriber::{filter::Targets, prelude::*};

use tessera::LoggingConfig;

pub fn setup_tracing(config: &LoggingConfig) -> miette::Result<()> {
    let level = config
        .max_level
        .as_deref()
        .and_then(|l| l.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    let mut filter = Targets::new()
        .with_target("tessera", level)
        .with_target("tessera_core", level)
        .with_target("tessera_daemon", level);

    if config.include_store {
        filter = filter.with_target("tessera_fjall", level);
    }

    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish()
        .with(filter)
        .init();

    Ok(())
}
