//! Command-line flags. Grounded on the pack-wide `clap`-derive pattern
//! (e.g. `other_examples/manifests/maskdotdev-sombra`); the teacher's own
//! agent binary took no flags, reading everything from environment
//! variables, which spec.md §6 replaces with an explicit CLI contract.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "anomalous-agent", about = "Host telemetry and supervision agent")]
pub struct Cli {
    #[arg(long, default_value = "/etc/anomalous-agent/config.yml")]
    pub config: PathBuf,

    #[arg(long)]
    pub pidfile: PathBuf,
}
