use cfxbatch_core::error::Result;

pub mod cli;
pub mod commands;

use cli::{Cli, Commands};

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::DetectCfx => commands::handle_detect_cfx(),
        Commands::CreateConfig(args) => commands::handle_create_config(&args.config),
        Commands::Validate(args) => commands::handle_validate(&args.config),
        Commands::Info(args) => commands::handle_info(&args.config),
        Commands::ClusterStatus(args) => commands::handle_cluster_status(&args.config),
        Commands::Run(args) => commands::run::handle_run(args),
    }
}
