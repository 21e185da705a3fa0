use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Parametric CFX batch automation for HPC clusters.",
    long_about = "Expands a base CFX model into one case per back pressure, stages the cases \
to a cluster over SSH, submits them under SLURM or PBS, and monitors them to completion."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        long,
        global = true,
        help = "Log verbosity: error, warn, info, debug, trace"
    )]
    pub log_level: Option<String>,

    #[arg(
        long,
        global = true,
        help = "Append log output to this file instead of stderr"
    )]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the locally discovered ANSYS CFX installation.
    DetectCfx,
    /// Write a default configuration YAML to the given path.
    CreateConfig(ConfigPathArgs),
    /// Validate a configuration file, reporting every error.
    Validate(ConfigPathArgs),
    /// Print an environment/project/cluster configuration summary.
    Info(ConfigPathArgs),
    /// Connect to the cluster and print the normalized node inventory.
    ClusterStatus(ConfigPathArgs),
    /// Execute the batch pipeline.
    Run(RunArgs),
}

#[derive(Args)]
pub struct ConfigPathArgs {
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct RunArgs {
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    #[arg(
        long,
        value_name = "PRESSURE",
        num_args = 1..,
        help = "Override the configured pressure list"
    )]
    pub pressure_list: Vec<f64>,

    #[arg(long, help = "Stop after enumerating the planned jobs")]
    pub dry_run: bool,

    #[arg(
        long,
        value_name = "STEP",
        num_args = 1..,
        help = "Execute only these steps, in the supplied order"
    )]
    pub steps: Vec<String>,
}
