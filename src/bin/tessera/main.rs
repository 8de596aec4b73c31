use std::path::PathBuf;

use clap::Parser;
use miette::{Context, IntoDiagnostic, Result};

mod common;
mod daemon;
mod init;

#[derive(Parser)]
#[clap(name = "Tessera")]
#[clap(bin_name = "tessera")]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Path to the daemon configuration file
    #[clap(long, global = true, default_value = "tessera.toml")]
    config: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the storage daemon
    Daemon(daemon::Args),
    /// Write starter configuration files
    Init(init::Args),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Init(args) => init::run(&args),
        Command::Daemon(args) => {
            let config = tessera::Config::load(&cli.config)
                .into_diagnostic()
                .context("loading configuration")?;

            common::setup_tracing(&config.logging)?;
            daemon::run(config, &args)
        }
    }
}
